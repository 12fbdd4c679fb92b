//! Subject detection seam.
//!
//! The model itself is opaque: anything that can turn a frame into
//! class/confidence/box triples satisfies [`SubjectDetector`]. The pipeline
//! only decides whether the configured target class is among them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use birdwatch_types::{
    config::{DetectorBackendKind, DetectorConfig},
    vision::{Detection, DetectionSet, Frame},
    BirdwatchError, Result,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::vision_error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionThresholds {
    pub confidence: f32,
    pub overlap: f32,
}

impl DetectionThresholds {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            confidence: config.confidence_threshold,
            overlap: config.overlap_threshold,
        }
    }
}

#[async_trait]
pub trait SubjectDetector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    async fn detect(&self, frame: &Frame, thresholds: DetectionThresholds)
        -> Result<DetectionSet>;
}

/// Decides whether a detection set contains the subject of interest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetFilter {
    pub class_id: u32,
    pub min_confidence: f32,
}

impl TargetFilter {
    pub fn new(class_id: u32, min_confidence: f32) -> Self {
        Self {
            class_id,
            min_confidence,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        Ok(Self::new(config.target()?, config.confidence_threshold))
    }

    pub fn is_target(&self, detection: &Detection) -> bool {
        detection.class_id == self.class_id && detection.confidence >= self.min_confidence
    }

    pub fn subject_found(&self, detections: &[Detection]) -> bool {
        detections.iter().any(|d| self.is_target(d))
    }

    pub fn best_match<'a>(&self, detections: &'a [Detection]) -> Option<&'a Detection> {
        detections
            .iter()
            .filter(|d| self.is_target(d))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Detector that never reports anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

#[async_trait]
impl SubjectDetector for NullDetector {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn detect(&self, _frame: &Frame, _thresholds: DetectionThresholds) -> Result<DetectionSet> {
        Ok(Vec::new())
    }
}

/// Detector returning a fixed answer on every call. Used by tests and the
/// dry-run path.
#[derive(Clone)]
pub struct StaticDetector {
    answer: std::result::Result<DetectionSet, String>,
    calls: Arc<Mutex<u64>>,
}

impl StaticDetector {
    pub fn returning(detections: DetectionSet) -> Self {
        Self {
            answer: Ok(detections),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            answer: Err(message.into()),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.lock().map(|c| *c).unwrap_or_default()
    }
}

#[async_trait]
impl SubjectDetector for StaticDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn detect(&self, _frame: &Frame, _thresholds: DetectionThresholds) -> Result<DetectionSet> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        self.answer.clone().map_err(vision_error)
    }
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Client for an inference service that accepts a JPEG body and answers
/// with `{"detections": [{"class_id", "confidence", "box": [x1, y1, x2, y2]}]}`.
pub struct RemoteDetector {
    endpoint: String,
    client: reqwest::Client,
    jpeg_quality: u8,
}

impl RemoteDetector {
    pub fn new(config: &DetectorConfig, jpeg_quality: u8) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            BirdwatchError::Configuration("detector.endpoint is required for the remote backend".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| {
                BirdwatchError::Configuration(format!("failed to build detector client: {err}"))
            })?;
        Ok(Self {
            endpoint,
            client,
            jpeg_quality,
        })
    }
}

#[async_trait]
impl SubjectDetector for RemoteDetector {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn detect(&self, frame: &Frame, thresholds: DetectionThresholds) -> Result<DetectionSet> {
        let body = frame
            .encode_jpeg(self.jpeg_quality)
            .map_err(|err| vision_error(format!("failed to encode frame for detector: {err}")))?;
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("conf", thresholds.confidence.to_string()),
                ("iou", thresholds.overlap.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await
            .map_err(|err| vision_error(format!("detector request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(vision_error(format!(
                "detector answered HTTP {}",
                status.as_u16()
            )));
        }
        let parsed: RemoteResponse = response
            .json()
            .await
            .map_err(|err| vision_error(format!("detector response is not valid JSON: {err}")))?;
        debug!("Remote detector returned {} detections", parsed.detections.len());
        Ok(parsed.detections)
    }
}

/// Builds the configured backend.
pub fn build_detector(config: &DetectorConfig, jpeg_quality: u8) -> Result<Box<dyn SubjectDetector>> {
    let detector: Box<dyn SubjectDetector> = match config.backend {
        DetectorBackendKind::Remote => Box::new(RemoteDetector::new(config, jpeg_quality)?),
        DetectorBackendKind::None => Box::new(NullDetector),
    };
    info!("Using '{}' detector backend", detector.name());
    Ok(detector)
}

#[async_trait]
impl<T: SubjectDetector + ?Sized> SubjectDetector for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn warm_up(&self) -> Result<()> {
        (**self).warm_up().await
    }

    async fn detect(&self, frame: &Frame, thresholds: DetectionThresholds) -> Result<DetectionSet> {
        (**self).detect(frame, thresholds).await
    }
}
