//! Error type for the training pipeline

use std::path::PathBuf;
use thiserror::Error;

pub type DebiasResult<T> = Result<T, DebiasError>;

#[derive(Debug, Error)]
pub enum DebiasError {
    #[error("dataset exposes no ground-truth label array; the loss tracker cannot be built")]
    MissingLabels,
    #[error("sample index {index} is outside the tracked index space of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("class {class} is outside 0..{num_classes}")]
    ClassOutOfRange { class: usize, num_classes: usize },
    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("attribute tuple {key:?} has {} entries, expected {expected}", .key.len())]
    AttributeArity { key: Vec<u32>, expected: usize },
    #[error("unsupported fetch mode '{0}'")]
    UnsupportedMode(String),
    #[error("checkpoint not found: {path}")]
    CheckpointNotFound { path: PathBuf },
    #[error("batch source produced no batches")]
    EmptySource,
    #[error("dataset error at {path}: {msg}")]
    Dataset { path: PathBuf, msg: String },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
