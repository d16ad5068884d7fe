//! Batch inference over folders of page images with per-folder COCO output.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use image::RgbImage;
use tracing::instrument;

use crate::{
    coco::{CocoAnnotation, CocoFile, CocoImage},
    overlay::{draw_detections, OverlayStyle},
    polygon::{mask_area, mask_to_polygons},
    CategoryIndex, Detection, DetectionOptions, InstanceSegmenter, LayoutAnalyzer, Result,
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// How image and annotation ids are shared between output folders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdScope {
    /// Every folder starts again at 0.
    #[default]
    PerFolder,
    /// One monotonic sequence across the whole run.
    Global,
}

#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Id the next call to [`IdGenerator::next_id`] will hand out.
    pub fn peek(&self) -> u64 {
        self.next
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub detection: DetectionOptions,
    pub results_file_name: String,
    pub result_image_prefix: String,
    pub id_scope: IdScope,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            detection: DetectionOptions::default(),
            results_file_name: "results.json".to_string(),
            result_image_prefix: "result_".to_string(),
            id_scope: IdScope::PerFolder,
        }
    }
}

pub struct ProcessedImage {
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
    pub overlay: RgbImage,
}

/// Result of processing one image; failures carry the reason and are skipped by the caller.
pub enum ImageOutcome {
    Processed(ProcessedImage),
    Failed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub folders: usize,
    pub images: usize,
    pub failed: usize,
    pub annotations: usize,
    pub results_files: Vec<PathBuf>,
}

/// Detects, thresholds and draws one image. Never fails as a whole.
#[instrument(skip(analyzer, index, style, options))]
pub fn process_image<S: InstanceSegmenter>(
    analyzer: &LayoutAnalyzer<S>,
    path: &Path,
    options: DetectionOptions,
    index: &CategoryIndex,
    style: &OverlayStyle,
) -> ImageOutcome {
    let attempt = || -> Result<ProcessedImage> {
        let image = image::open(path)?;
        let detections = analyzer.detect(&image, options)?;
        if detections.is_empty() {
            log::info!("No targets detected in {}", path.display());
        }
        let overlay = draw_detections(&image, &detections, index, style);
        Ok(ProcessedImage {
            file_name: file_name(path),
            width: image.width(),
            height: image.height(),
            detections,
            overlay,
        })
    };
    match attempt() {
        Ok(processed) => ImageOutcome::Processed(processed),
        Err(e) => ImageOutcome::Failed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    }
}

/// Turns one detection into a COCO annotation. Detections whose mask has no contour yield `None`.
pub fn annotation_from_detection(
    detection: &Detection,
    id: u64,
    image_id: u64,
    options: DetectionOptions,
) -> Option<CocoAnnotation> {
    let segmentation = mask_to_polygons(
        detection.mask.view(),
        options.mask_threshold,
        options.max_polygon_points,
    );
    if segmentation.is_empty() {
        return None;
    }
    Some(CocoAnnotation {
        id,
        image_id,
        category_id: detection.category_id,
        segmentation: segmentation.into(),
        bbox: detection.xywh(),
        area: mask_area(detection.mask.view(), options.mask_threshold),
        iscrowd: 0,
        ignore: 0,
    })
}

/// Accumulates the COCO file of one output folder.
pub struct FolderAggregator {
    coco: CocoFile,
    image_ids: IdGenerator,
    annotation_ids: IdGenerator,
}

impl FolderAggregator {
    pub fn new(image_ids: IdGenerator, annotation_ids: IdGenerator) -> Self {
        Self {
            coco: CocoFile::with_layout_categories(),
            image_ids,
            annotation_ids,
        }
    }

    /// Records the image (even with zero detections) and its annotations; returns the image id.
    pub fn record(&mut self, image: &ProcessedImage, options: DetectionOptions) -> u64 {
        let image_id = self.image_ids.next_id();
        for detection in &image.detections {
            let id = self.annotation_ids.peek();
            match annotation_from_detection(detection, id, image_id, options) {
                Some(annotation) => {
                    self.annotation_ids.next_id();
                    self.coco.annotations.push(annotation);
                }
                None => log::warn!(
                    "Dropping {} detection in {}: mask has no contour",
                    detection.category_id,
                    image.file_name
                ),
            }
        }
        self.coco.images.push(CocoImage {
            id: image_id,
            file_name: image.file_name.clone(),
            width: image.width,
            height: image.height,
        });
        image_id
    }

    pub fn coco(&self) -> &CocoFile {
        &self.coco
    }

    /// Hands back the id generators so a global scope can continue where this folder stopped.
    pub fn finish(self) -> (CocoFile, IdGenerator, IdGenerator) {
        (self.coco, self.image_ids, self.annotation_ids)
    }
}

/// Processes every directory below `input_root` into `output_root/<dir name>/`.
pub struct FolderRunner<'a, S> {
    analyzer: &'a LayoutAnalyzer<S>,
    index: &'a CategoryIndex,
    style: &'a OverlayStyle,
    options: RunnerOptions,
}

impl<'a, S: InstanceSegmenter> FolderRunner<'a, S> {
    pub fn new(
        analyzer: &'a LayoutAnalyzer<S>,
        index: &'a CategoryIndex,
        style: &'a OverlayStyle,
        options: RunnerOptions,
    ) -> Self {
        Self {
            analyzer,
            index,
            style,
            options,
        }
    }

    #[instrument(skip(self))]
    pub fn run(&self, input_root: &Path, output_root: &Path) -> Result<RunSummary> {
        fs::create_dir_all(output_root)?;
        let mut summary = RunSummary::default();
        let mut image_ids = IdGenerator::default();
        let mut annotation_ids = IdGenerator::default();

        let mut used_names = BTreeSet::new();
        for folder in sub_directories(input_root)? {
            if self.options.id_scope == IdScope::PerFolder {
                image_ids = IdGenerator::default();
                annotation_ids = IdGenerator::default();
            }
            let name = output_folder_name(&folder, &mut used_names);
            let output_folder = output_root.join(&name);
            let (ids, anns) =
                self.run_folder(&folder, &output_folder, image_ids, annotation_ids, &mut summary)?;
            image_ids = ids;
            annotation_ids = anns;
        }
        log::info!(
            "Processed {} images in {} folders ({} failed, {} annotations)",
            summary.images,
            summary.folders,
            summary.failed,
            summary.annotations
        );
        Ok(summary)
    }

    #[instrument(skip(self, image_ids, annotation_ids, summary))]
    fn run_folder(
        &self,
        folder: &Path,
        output_folder: &Path,
        image_ids: IdGenerator,
        annotation_ids: IdGenerator,
        summary: &mut RunSummary,
    ) -> Result<(IdGenerator, IdGenerator)> {
        fs::create_dir_all(output_folder)?;
        let mut aggregator = FolderAggregator::new(image_ids, annotation_ids);

        for path in image_files(folder)? {
            match process_image(
                self.analyzer,
                &path,
                self.options.detection,
                self.index,
                self.style,
            ) {
                ImageOutcome::Processed(processed) => {
                    let result_path = output_folder.join(format!(
                        "{}{}",
                        self.options.result_image_prefix, processed.file_name
                    ));
                    if let Err(e) = processed.overlay.save(&result_path) {
                        log::warn!("Error saving {}: {e}", result_path.display());
                    }
                    aggregator.record(&processed, self.options.detection);
                    summary.images += 1;
                }
                ImageOutcome::Failed { path, reason } => {
                    log::warn!("Error processing image {}: {reason}", path.display());
                    summary.failed += 1;
                }
            }
        }

        let (coco, image_ids, annotation_ids) = aggregator.finish();
        let results_path = output_folder.join(&self.options.results_file_name);
        coco.save(&results_path)?;
        summary.folders += 1;
        summary.annotations += coco.annotations.len();
        summary.results_files.push(results_path);
        Ok((image_ids, annotation_ids))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|it| it.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|it| it.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Output folders are named after the input leaf directory. A repeated leaf name gets a
/// `_2`, `_3`, ... suffix so an earlier folder's results are not overwritten.
fn output_folder_name(folder: &Path, used: &mut BTreeSet<String>) -> String {
    let name = file_name(folder);
    if used.insert(name.clone()) {
        return name;
    }
    let unique = (2..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_default();
    log::warn!(
        "Output folder `{name}` already used, writing {} to `{unique}`",
        folder.display()
    );
    used.insert(unique.clone());
    unique
}

/// All directories below `root`, depth first, excluding `root` itself. Symlinks are not
/// followed.
pub fn sub_directories(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = vec![];
    let mut children = vec![];
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push(entry.path());
        }
    }
    children.sort();
    for child in children {
        found.push(child.clone());
        found.extend(sub_directories(&child)?);
    }
    Ok(found)
}

/// Image files directly inside `folder`, sorted by name.
pub fn image_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = fs::read_dir(folder)?
        .map(|entry| entry.map(|it| it.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    files.retain(|it| it.is_file() && is_image_file(it));
    files.sort();
    Ok(files)
}
