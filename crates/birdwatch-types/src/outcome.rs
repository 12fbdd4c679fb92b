use std::{fmt, path::PathBuf};

use crate::{
    vision::{DetectionSet, Frame, QualityReport},
    BirdwatchError,
};

/// States of the capture-filter-store loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Capturing,
    Assessing,
    Detecting,
    Storing,
    Waiting,
    Done,
}

/// Stage a per-cycle error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Capture,
    Detect,
    Annotate,
    Store,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleStage::Capture => "capture",
            CycleStage::Detect => "detect",
            CycleStage::Annotate => "annotate",
            CycleStage::Store => "store",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct CycleFailure {
    pub stage: CycleStage,
    pub error: BirdwatchError,
}

/// Everything one iteration produced. Discarded once the scheduler has
/// picked the next interval.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub frame: Option<Frame>,
    pub quality: Option<QualityReport>,
    pub detections: DetectionSet,
    pub subject_found: bool,
    pub error: Option<CycleFailure>,
    pub stored: Vec<PathBuf>,
    pub storage_failures: usize,
}

impl CycleOutcome {
    pub fn failed(stage: CycleStage, error: BirdwatchError) -> Self {
        Self {
            error: Some(CycleFailure { stage, error }),
            ..Default::default()
        }
    }

    pub fn is_blurred(&self) -> bool {
        self.quality.map(|q| q.is_blurred).unwrap_or(false)
    }

    /// Only the first error of a cycle is kept; later ones are logged at the
    /// point of occurrence.
    pub fn record_error(&mut self, stage: CycleStage, error: BirdwatchError) {
        if self.error.is_none() {
            self.error = Some(CycleFailure { stage, error });
        }
    }

    pub fn capture_failed(&self) -> bool {
        matches!(
            self.error,
            Some(CycleFailure {
                stage: CycleStage::Capture,
                ..
            })
        )
    }
}
