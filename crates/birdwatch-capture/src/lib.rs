//! Still-image acquisition.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use birdwatch_types::{vision::Frame, BirdwatchError, Result};
use tracing::debug;

mod http;

pub use http::HttpImageSource;

/// Acquisition counters.
#[derive(Debug, Default, Clone)]
pub struct CaptureMetrics {
    pub successful_captures: u64,
    pub failed_captures: u64,
    pub last_bytes: usize,
}

/// Produces one frame per call. Implementations never retry internally;
/// retry policy belongs to the caller.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Startup reachability check. Only a failure that cannot self-heal
    /// should be reported here.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
    async fn capture(&self) -> Result<Frame>;
    fn metrics(&self) -> CaptureMetrics;
}

/// Source that replays a fixed sequence of results, used in tests and dry
/// runs. Once the script is exhausted every capture fails.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Result<Frame>>>>,
    metrics: Arc<Mutex<CaptureMetrics>>,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = Result<Frame>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            metrics: Arc::new(Mutex::new(CaptureMetrics::default())),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ImageSource for ScriptedSource {
    async fn capture(&self) -> Result<Frame> {
        let next = self
            .script
            .lock()
            .map_err(|_| capture_error("failed to lock capture script"))?
            .pop_front()
            .unwrap_or_else(|| Err(capture_error("capture script exhausted")));
        if let Ok(mut metrics) = self.metrics.lock() {
            match &next {
                Ok(frame) => {
                    metrics.successful_captures += 1;
                    metrics.last_bytes = frame.data.len();
                }
                Err(_) => metrics.failed_captures += 1,
            }
        }
        debug!("Scripted capture, {} entries left", self.remaining());
        next
    }

    fn metrics(&self) -> CaptureMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

pub fn capture_error(message: impl Into<String>) -> BirdwatchError {
    BirdwatchError::Network(message.into())
}

pub fn decode_error(message: impl Into<String>) -> BirdwatchError {
    BirdwatchError::Decode(message.into())
}
