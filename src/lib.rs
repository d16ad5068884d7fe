use std::path::PathBuf;

use image::DynamicImage;
use tracing::instrument;

mod category;
pub mod coco;
pub mod coco_eval;
pub mod dataset;
mod error;
pub mod evaluation;
pub mod maskrcnn;
pub mod overlay;
pub mod polygon;
mod result;
pub mod runner;
pub mod scoring;
pub mod training;
mod util;

pub use category::*;
pub use coco::CocoFile;
pub use dataset::{DatasetRegistry, DatasetSplit};
pub use error::{ensure_exists, Error, Result};
pub use maskrcnn::{InstanceSegmenter, MaskRcnn};
pub use result::*;

pub use ort as runtime;

pub struct LayoutAnalyzerBuilder {
    threads: usize,
    model_path: Option<PathBuf>,
    input_name: String,
    cache_path: Option<PathBuf>,
    execution_providers: Vec<ExecutionProvider>,
}

impl LayoutAnalyzerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn model(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Name of the image input of the exported graph.
    pub fn input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = name.into();
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    /// Loads the model. A missing model file is reported before ONNX Runtime is touched.
    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<LayoutAnalyzer<MaskRcnn>> {
        let model_path = self
            .model_path
            .take()
            .unwrap_or_else(|| "models/maskrcnn_tca.onnx".into());
        let model_path = ensure_exists(model_path)?;
        let segmenter = MaskRcnn::init(
            model_path,
            self.input_name,
            self.threads,
            &self.execution_providers,
            self.cache_path,
        )?;
        Ok(LayoutAnalyzer::with_segmenter(segmenter))
    }
}

impl Default for LayoutAnalyzerBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            model_path: None,
            input_name: "image".to_string(),
            cache_path: None,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

pub struct LayoutAnalyzer<S = MaskRcnn> {
    segmenter: S,
}

impl<S: InstanceSegmenter> LayoutAnalyzer<S> {
    pub fn with_segmenter(segmenter: S) -> Self {
        Self { segmenter }
    }

    pub fn segmenter(&self) -> &S {
        &self.segmenter
    }

    /// Runs the model and keeps the detections scoring at least `options.score_threshold`.
    #[instrument(skip(self, image))]
    pub fn detect(
        &self,
        image: &DynamicImage,
        options: DetectionOptions,
    ) -> Result<Vec<Detection>> {
        let prediction = self.segmenter.predict(image)?;
        let expected = (image.height() as usize, image.width() as usize);
        let mask_dims = (prediction.masks.shape()[1], prediction.masks.shape()[2]);
        if !prediction.is_empty() && mask_dims != expected {
            return Err(Error::MalformedPrediction(format!(
                "mask size {mask_dims:?} does not match image size {expected:?}"
            )));
        }
        let raw_count = prediction.len();
        let detections = prediction.into_detections(options.score_threshold)?;
        log::debug!(
            "Kept {} of {raw_count} instances at threshold {}",
            detections.len(),
            options.score_threshold
        );
        Ok(detections)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionOptions {
    pub score_threshold: f32,
    pub mask_threshold: f32,
    pub max_polygon_points: usize,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.8,
            mask_threshold: 0.5,
            max_polygon_points: polygon::MAX_POLYGON_POINTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];
