use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = BirdwatchError> = std::result::Result<T, E>;

/// Unified error type covering every failure class of the pipeline.
///
/// Only `Configuration` is fatal; the rest are contained by the cycle that
/// produced them.
#[derive(Debug, Error)]
pub enum BirdwatchError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("detector error: {0}")]
    Detector(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("annotation error: {0}")]
    Annotation(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BirdwatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BirdwatchError::Configuration(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot create directory {path:?}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode image for {path:?}: {message}")]
    Encode { path: PathBuf, message: String },
}
