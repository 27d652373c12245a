use std::path::PathBuf;

use thiserror::Error;
use vip_core::CoreError;
use vip_query::QueryError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset file not found: {0}")]
    MissingFile(PathBuf),

    #[error("{path}: bad IDX magic number, expected {expected:#010x}, got {got:#010x}")]
    BadMagic {
        path: PathBuf,
        expected: u32,
        got: u32,
    },

    #[error("{path}: truncated, expected {expected} bytes, got {got}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        got: usize,
    },

    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("Label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Unsupported dtype {dtype} for tensor {name}")]
    UnsupportedDtype { name: String, dtype: String },
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TrainResult<T> = std::result::Result<T, TrainError>;
