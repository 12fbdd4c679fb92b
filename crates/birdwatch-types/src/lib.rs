//! Shared domain types for the birdwatch pipeline.

pub mod config;
pub mod outcome;
pub mod taxonomy;
pub mod telemetry;
pub mod vision;

mod errors;

pub use errors::{BirdwatchError, Result, StorageError};
