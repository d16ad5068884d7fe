//! COCO-style records written by the folder runner and read back for evaluation.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{error::ensure_exists, Category, Result};

/// Either flattened `x, y` polygons or a run-length encoded mask (used by crowd regions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    Polygons(Vec<Vec<f32>>),
    Rle(Rle),
}

impl Default for Segmentation {
    fn default() -> Self {
        Self::Polygons(vec![])
    }
}

impl From<Vec<Vec<f32>>> for Segmentation {
    fn from(polygons: Vec<Vec<f32>>) -> Self {
        Self::Polygons(polygons)
    }
}

impl Segmentation {
    /// Polygons, or nothing for an RLE mask.
    pub fn polygons(&self) -> &[Vec<f32>] {
        match self {
            Self::Polygons(polygons) => polygons,
            Self::Rle(_) => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Polygons(polygons) => polygons.is_empty(),
            Self::Rle(rle) => rle.area() == 0,
        }
    }
}

/// COCO run-length encoding over a column-major `[height, width]` mask, starting with a
/// run of zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rle {
    /// `[height, width]`.
    pub size: [u32; 2],
    pub counts: RleCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    Runs(Vec<u32>),
    /// pycocotools' compressed string form.
    Compressed(String),
}

impl Rle {
    pub fn height(&self) -> u32 {
        self.size[0]
    }

    pub fn width(&self) -> u32 {
        self.size[1]
    }

    /// Plain run lengths, decompressing the string form if needed.
    pub fn runs(&self) -> Vec<u32> {
        match &self.counts {
            RleCounts::Runs(runs) => runs.clone(),
            RleCounts::Compressed(text) => decompress_counts(text),
        }
    }

    pub fn area(&self) -> u64 {
        self.runs().iter().skip(1).step_by(2).map(|it| *it as u64).sum()
    }

    /// Foreground pixels as `(x, y)`.
    pub fn foreground(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let height = self.height().max(1) as u64;
        let runs = self.runs();
        let mut start = 0u64;
        let mut spans = vec![];
        for (i, run) in runs.into_iter().enumerate() {
            let end = start + run as u64;
            if i % 2 == 1 {
                spans.push(start..end);
            }
            start = end;
        }
        spans
            .into_iter()
            .flatten()
            .map(move |index| ((index / height) as u32, (index % height) as u32))
    }
}

/// Decodes pycocotools' LEB128-like count string: 5 bits per character offset by 48, with
/// counts after the second stored as a delta to the count two positions back.
fn decompress_counts(text: &str) -> Vec<u32> {
    let bytes = text.as_bytes();
    let mut counts: Vec<i64> = vec![];
    let mut i = 0;
    while i < bytes.len() {
        let mut value = 0i64;
        let mut shift = 0;
        let mut more = true;
        while more && i < bytes.len() {
            let c = bytes[i].wrapping_sub(48) as i64;
            i += 1;
            value |= (c & 0x1f) << shift;
            more = c & 0x20 != 0;
            shift += 5;
            if !more && c & 0x10 != 0 {
                value |= -1i64 << shift;
            }
        }
        if counts.len() > 2 {
            value += counts[counts.len() - 2];
        }
        counts.push(value);
    }
    counts.into_iter().map(|it| it.max(0) as u32).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoFile {
    pub images: Vec<CocoImage>,
    pub categories: Vec<CocoCategory>,
    pub annotations: Vec<CocoAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u32,
    #[serde(default)]
    pub segmentation: Segmentation,
    /// `[x, y, width, height]`.
    pub bbox: [f32; 4],
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u8,
    #[serde(default)]
    pub ignore: u8,
}

impl Default for CocoFile {
    fn default() -> Self {
        Self::with_layout_categories()
    }
}

impl CocoFile {
    /// Empty file carrying the four fixed layout categories.
    pub fn with_layout_categories() -> Self {
        Self {
            images: vec![],
            categories: Category::ALL
                .iter()
                .map(|it| CocoCategory {
                    id: it.id(),
                    name: it.name().to_string(),
                })
                .collect(),
            annotations: vec![],
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = ensure_exists(path.as_ref())?;
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes the file with two-space indentation.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn annotations_for(&self, image_id: u64) -> impl Iterator<Item = &CocoAnnotation> {
        self.annotations
            .iter()
            .filter(move |it| it.image_id == image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_truth_without_optional_fields_parses() {
        let json = r#"{
            "images": [{"id": 7, "file_name": "a.png", "width": 10, "height": 20}],
            "categories": [{"id": 2, "name": "Text"}],
            "annotations": [
                {"id": 1, "image_id": 7, "category_id": 2, "bbox": [1, 2, 3, 4], "area": 12}
            ]
        }"#;
        let coco: CocoFile = serde_json::from_str(json).unwrap();
        assert_eq!(coco.annotations[0].iscrowd, 0);
        assert!(coco.annotations[0].segmentation.is_empty());
        assert_eq!(coco.annotations_for(7).count(), 1);
        assert_eq!(coco.annotations_for(8).count(), 0);
    }

    #[test]
    fn layout_categories_are_fixed() {
        let coco = CocoFile::with_layout_categories();
        let names = coco
            .categories
            .iter()
            .map(|it| (it.id, it.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![(1, "Table"), (2, "Text"), (3, "Title"), (4, "Image")]
        );
    }

    #[test]
    fn saved_json_uses_two_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        CocoFile::with_layout_categories().save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n  \"images\": []"));
        assert_eq!(CocoFile::load(&path).unwrap(), CocoFile::default());
    }

    #[test]
    fn crowd_rle_annotations_parse() {
        let json = r#"[
            {"id": 1, "image_id": 7, "category_id": 1, "bbox": [0, 0, 2, 2], "area": 3,
             "iscrowd": 1, "segmentation": {"size": [3, 2], "counts": [1, 3, 2]}},
            {"id": 2, "image_id": 7, "category_id": 2, "bbox": [1, 2, 3, 4], "area": 12,
             "segmentation": [[1, 2, 4, 2, 4, 6]]}
        ]"#;
        let annotations: Vec<CocoAnnotation> = serde_json::from_str(json).unwrap();
        let Segmentation::Rle(rle) = &annotations[0].segmentation else {
            panic!("expected RLE, got {:?}", annotations[0].segmentation);
        };
        assert_eq!(rle.area(), 3);
        assert!(annotations[0].segmentation.polygons().is_empty());
        // column-major: indices 1, 2, 3 of a 3-row mask
        let pixels = rle.foreground().collect::<Vec<_>>();
        assert_eq!(pixels, vec![(0, 1), (0, 2), (1, 0)]);
        assert_eq!(annotations[1].segmentation.polygons().len(), 1);
    }

    #[test]
    fn compressed_counts_decode() {
        // runs after the second are stored as deltas, "N" is -2
        let rle = Rle {
            size: [7, 1],
            counts: RleCounts::Compressed("132N".to_string()),
        };
        assert_eq!(rle.runs(), vec![1, 3, 2, 1]);
        assert_eq!(rle.area(), 4);
    }
}
