//! Frame analysis: sharpness gate, subject detection and annotation.

use birdwatch_types::BirdwatchError;

mod annotate;
mod detector;
mod font;
mod quality;

pub use annotate::{Annotator, FrameAnnotator, OTHER_CLASS_COLOR, TARGET_CLASS_COLOR};
pub use detector::{
    build_detector, DetectionThresholds, NullDetector, RemoteDetector, StaticDetector,
    SubjectDetector, TargetFilter,
};
pub use quality::{assess, laplacian_variance, to_intensity, QualityGate};

pub fn vision_error(message: impl Into<String>) -> BirdwatchError {
    BirdwatchError::Detector(message.into())
}

pub fn annotation_error(message: impl Into<String>) -> BirdwatchError {
    BirdwatchError::Annotation(message.into())
}
