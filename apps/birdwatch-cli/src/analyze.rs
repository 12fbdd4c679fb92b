//! Offline check of local images against the same gate and detector the
//! capture loop uses.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use birdwatch_types::{
    config::BirdwatchConfig,
    taxonomy,
    vision::{Frame, QualityReport},
};
use birdwatch_vision::{build_detector, DetectionThresholds, QualityGate, SubjectDetector, TargetFilter};
use chrono::Local;
use serde_json::json;
use tracing::warn;

#[derive(Debug)]
pub struct Analysis {
    pub path: PathBuf,
    pub quality: QualityReport,
    pub detections: usize,
    pub subject_found: bool,
}

pub async fn run(config: &BirdwatchConfig, images: &[PathBuf], as_json: bool) -> Result<()> {
    let gate = QualityGate::new(config.quality.sharpness_threshold);
    let filter = TargetFilter::from_config(&config.detector)?;
    let thresholds = DetectionThresholds::from_config(&config.detector);
    let detector = build_detector(&config.detector, config.storage.jpeg_quality)?;

    let mut failures = 0usize;
    for path in images {
        match analyze_image(path, &gate, &detector, filter, thresholds).await {
            Ok(analysis) => println!("{}", render(&analysis, gate.threshold(), filter, as_json)),
            Err(err) => {
                failures += 1;
                warn!("Skipping {}: {err:#}", path.display());
            }
        }
    }
    if failures == images.len() {
        anyhow::bail!("none of the {} images could be analyzed", images.len());
    }
    Ok(())
}

pub async fn analyze_image<D: SubjectDetector>(
    path: &Path,
    gate: &QualityGate,
    detector: &D,
    filter: TargetFilter,
    thresholds: DetectionThresholds,
) -> Result<Analysis> {
    let image = image::open(path).with_context(|| format!("could not load {}", path.display()))?;
    let frame = Frame::from_image(image, Local::now());
    let quality = gate.assess(&frame);
    let detections = match detector.detect(&frame, thresholds).await {
        Ok(detections) => detections,
        Err(err) => {
            warn!("Detector failed on {}: {err}", path.display());
            Vec::new()
        }
    };
    Ok(Analysis {
        path: path.to_path_buf(),
        quality,
        detections: detections.len(),
        subject_found: filter.subject_found(&detections),
    })
}

fn render(analysis: &Analysis, threshold: f64, filter: TargetFilter, as_json: bool) -> String {
    let target = taxonomy::display_name(filter.class_id);
    if as_json {
        return json!({
            "path": analysis.path.display().to_string(),
            "variance": analysis.quality.sharpness_score,
            "threshold": threshold,
            "is_blurred": analysis.quality.is_blurred,
            "detections": analysis.detections,
            "target": target,
            "contains_target": analysis.subject_found,
        })
        .to_string();
    }
    format!(
        "{}: variance {:.2} (threshold {}) {}; {} {}",
        analysis.path.display(),
        analysis.quality.sharpness_score,
        threshold,
        if analysis.quality.is_blurred {
            "blurred"
        } else {
            "sharp"
        },
        target,
        if analysis.subject_found {
            "present"
        } else {
            "absent"
        }
    )
}
