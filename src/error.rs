use std::{collections::BTreeMap, path::PathBuf};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{} file does not exist.", .0.display())]
    MissingFile(PathBuf),
    #[error("unknown dataset split `{0}`")]
    UnknownSplit(String),
    #[error("malformed model output: {0}")]
    MalformedPrediction(String),
    #[error("invalid font: {0}")]
    Font(String),
    #[error("score sequences must be non-empty and of equal length (got {truth} and {predicted})")]
    ScoreSequence { truth: usize, predicted: usize },
    #[error("Loss is {loss}, stopping training ({losses:?})")]
    NonFiniteLoss {
        loss: f32,
        losses: BTreeMap<String, f32>,
    },
}

impl Error {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPrediction(message.into())
    }
}

/// Fails with [`Error::MissingFile`] unless `path` exists.
pub fn ensure_exists(path: impl Into<PathBuf>) -> Result<PathBuf> {
    let path = path.into();
    if path.exists() {
        Ok(path)
    } else {
        Err(Error::MissingFile(path))
    }
}
