//! Named dataset splits, passed explicitly to the evaluation and training entry points.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{CocoFile, Error, Result};

pub const TRAIN_SPLIT: &str = "TCA_train";
pub const VAL_SPLIT: &str = "TCA_val";

/// Environment variable overriding the dataset root.
pub const DATASETS_ENV: &str = "DETECTRON2_DATASETS";
pub const DEFAULT_DATASETS_ROOT: &str = "datasets";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSplit {
    pub name: String,
    pub image_root: PathBuf,
    pub annotation_file: PathBuf,
    pub evaluator_type: &'static str,
}

impl DatasetSplit {
    pub fn load_annotations(&self) -> Result<CocoFile> {
        CocoFile::load(&self.annotation_file)
    }

    pub fn image_path(&self, file_name: &str) -> PathBuf {
        self.image_root.join(file_name)
    }
}

#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    root: PathBuf,
    splits: BTreeMap<String, DatasetSplit>,
}

impl DatasetRegistry {
    /// Registry with the train and val splits of the layout dataset under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let annotations = root.join("annotations");
        let mut registry = Self {
            splits: BTreeMap::new(),
            root,
        };
        registry.register(DatasetSplit {
            name: TRAIN_SPLIT.to_string(),
            image_root: registry.root.join("Train"),
            annotation_file: annotations.join("train.json"),
            evaluator_type: "coco",
        });
        registry.register(DatasetSplit {
            name: VAL_SPLIT.to_string(),
            image_root: registry.root.join("val"),
            annotation_file: annotations.join("val.json"),
            evaluator_type: "coco",
        });
        registry
    }

    /// Registry rooted at `$DETECTRON2_DATASETS`, or `datasets` when unset.
    pub fn from_env() -> Self {
        Self::from_root_var(std::env::var_os(DATASETS_ENV))
    }

    /// Registry for a raw `$DETECTRON2_DATASETS` value. Unset or empty falls back to `datasets`.
    pub fn from_root_var(value: Option<OsString>) -> Self {
        let root = value
            .filter(|it| !it.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASETS_ROOT));
        log::debug!("Dataset root: {}", root.display());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Adds or replaces a split.
    pub fn register(&mut self, split: DatasetSplit) {
        self.splits.insert(split.name.clone(), split);
    }

    pub fn get(&self, name: &str) -> Result<&DatasetSplit> {
        self.splits
            .get(name)
            .ok_or_else(|| Error::UnknownSplit(name.to_string()))
    }

    pub fn splits(&self) -> impl Iterator<Item = &DatasetSplit> {
        self.splits.values()
    }
}
