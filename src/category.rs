use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use image::Rgb;
use serde::{Deserialize, Serialize};

use crate::{error::ensure_exists, Result};

/// Layout classes predicted by the model. Id 0 is the implicit background class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Table = 1,
    Text = 2,
    Title = 3,
    Image = 4,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Table,
        Category::Text,
        Category::Title,
        Category::Image,
    ];

    /// Class names in model output order, background included.
    pub const CLASS_NAMES: [&'static str; 5] = ["_background_", "Table", "Text", "Title", "Image"];

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Category::Table),
            2 => Some(Category::Text),
            3 => Some(Category::Title),
            4 => Some(Category::Image),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        Self::CLASS_NAMES[self as usize]
    }

    /// Whether regions of this class count towards the text area.
    pub fn is_textual(self) -> bool {
        matches!(self, Category::Text | Category::Title)
    }
}

const PALETTE: [Rgb<u8>; 6] = [
    Rgb([220, 20, 60]),
    Rgb([30, 144, 255]),
    Rgb([50, 205, 50]),
    Rgb([255, 165, 0]),
    Rgb([148, 0, 211]),
    Rgb([0, 206, 209]),
];

/// Drawing colour for a raw label id.
pub fn label_color(category_id: u32) -> Rgb<u8> {
    PALETTE[category_id as usize % PALETTE.len()]
}

/// Label index file contents, e.g. `{"1": "Table", "2": "Text"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryIndex {
    names: BTreeMap<String, String>,
}

impl CategoryIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = ensure_exists(path.as_ref())?;
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn name(&self, category_id: u32) -> &str {
        self.names
            .get(&category_id.to_string())
            .map(String::as_str)
            .unwrap_or("N/A")
    }
}

impl From<&[Category]> for CategoryIndex {
    fn from(categories: &[Category]) -> Self {
        Self {
            names: categories
                .iter()
                .map(|it| (it.id().to_string(), it.name().to_string()))
                .collect(),
        }
    }
}
