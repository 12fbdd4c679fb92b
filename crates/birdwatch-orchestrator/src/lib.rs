//! Capture, filter and store loop.

use async_trait::async_trait;
use birdwatch_capture::ImageSource;
use birdwatch_ops::{log_run_summary, prepare_archive_roots};
use birdwatch_storage::ArchiveWriter;
use birdwatch_types::{
    config::BirdwatchConfig,
    outcome::{CycleOutcome, CycleStage, PipelineState},
    taxonomy,
    telemetry::CycleStats,
    vision::Frame,
    BirdwatchError, Result,
};
use birdwatch_vision::{
    Annotator, DetectionThresholds, FrameAnnotator, QualityGate, SubjectDetector, TargetFilter,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod preview;
mod scheduler;

pub use preview::{PreviewSink, SnapshotPreview};
pub use scheduler::AdaptiveScheduler;

pub struct PipelineController<S, D>
where
    S: ImageSource,
    D: SubjectDetector,
{
    source: S,
    detector: D,
    gate: QualityGate,
    filter: TargetFilter,
    thresholds: DetectionThresholds,
    annotator: Box<dyn FrameAnnotator>,
    archive: ArchiveWriter,
    annotated_archive: Option<ArchiveWriter>,
    preview: Option<Box<dyn PreviewSink>>,
    scheduler: AdaptiveScheduler,
    stats: CycleStats,
    state: PipelineState,
}

impl<S, D> PipelineController<S, D>
where
    S: ImageSource,
    D: SubjectDetector,
{
    /// Fails with a configuration error when the target class is unusable.
    pub fn new(config: &BirdwatchConfig, source: S, detector: D) -> Result<Self> {
        let filter = TargetFilter::from_config(&config.detector)?;
        let storage = &config.storage;
        let annotated_archive = storage.store_annotated.then(|| {
            ArchiveWriter::new(&storage.annotated_root, storage.jpeg_quality)
                .with_suffix(storage.annotated_suffix.clone())
        });
        Ok(Self {
            source,
            detector,
            gate: QualityGate::new(config.quality.sharpness_threshold),
            filter,
            thresholds: DetectionThresholds::from_config(&config.detector),
            annotator: Box::new(Annotator::new(filter.class_id)),
            archive: ArchiveWriter::new(&storage.root, storage.jpeg_quality),
            annotated_archive,
            preview: None,
            scheduler: AdaptiveScheduler::from_config(&config.schedule),
            stats: CycleStats::default(),
            state: PipelineState::Idle,
        })
    }

    pub fn with_preview(mut self, sink: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(sink);
        self
    }

    /// Startup checks. Any error returned here is fatal.
    pub async fn boot(&mut self, config: &BirdwatchConfig) -> Result<()> {
        prepare_archive_roots(&config.storage)?;
        if config.camera.probe_on_start {
            self.source.probe().await?;
        }
        if let Err(err) = self.detector.warm_up().await {
            warn!("Detector '{}' warm-up failed: {err}", self.detector.name());
        }
        info!(
            target_class = self.filter.class_id,
            target_name = %taxonomy::display_name(self.filter.class_id),
            threshold = self.gate.threshold(),
            detector = self.detector.name(),
            "Pipeline ready"
        );
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState, cycle: u64) {
        debug!(cycle, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    /// One capture-assess-detect-store pass. Never fails; every error is
    /// logged and recorded in the outcome.
    pub async fn run_cycle(&mut self, cycle: u64) -> CycleOutcome {
        self.transition(PipelineState::Capturing, cycle);
        let frame = match self.source.capture().await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(cycle, stage = %CycleStage::Capture, cause = %err, "Capture failed");
                return CycleOutcome::failed(CycleStage::Capture, err);
            }
        };

        self.transition(PipelineState::Assessing, cycle);
        let quality = self.gate.assess(&frame);

        self.transition(PipelineState::Detecting, cycle);
        let mut outcome = CycleOutcome::default();
        let detections = match self.detector.detect(&frame, self.thresholds).await {
            Ok(detections) => detections,
            Err(err) => {
                warn!(cycle, stage = %CycleStage::Detect, cause = %err, "Detector failed; treating as no detections");
                outcome.record_error(CycleStage::Detect, err);
                Vec::new()
            }
        };
        let best = self.filter.best_match(&detections).map(|d| d.confidence);
        let subject_found = best.is_some();
        info!(
            cycle,
            sharpness = quality.sharpness_score,
            blurred = quality.is_blurred,
            detections = detections.len(),
            subject_found,
            best_confidence = ?best,
            "Frame assessed"
        );

        let should_store = subject_found && !quality.is_blurred;
        let annotated = if self.preview.is_some() || (should_store && self.annotated_archive.is_some())
        {
            match self.annotator.annotate(&frame, &detections) {
                Ok(annotated) => Some(annotated),
                Err(err) => {
                    warn!(cycle, stage = %CycleStage::Annotate, cause = %err, "Annotation failed; keeping plain frame only");
                    outcome.record_error(CycleStage::Annotate, err);
                    None
                }
            }
        } else {
            None
        };

        if let (Some(preview), Some(annotated)) = (self.preview.as_mut(), annotated.as_ref()) {
            if let Err(err) = preview.show(annotated) {
                warn!(cycle, cause = %err, "Preview update failed");
            }
        }

        if should_store {
            self.transition(PipelineState::Storing, cycle);
            self.store(cycle, &frame, annotated.as_ref(), &mut outcome);
        } else if subject_found {
            info!(cycle, "Subject present but frame is blurred; not storing");
        }

        outcome.frame = Some(frame);
        outcome.quality = Some(quality);
        outcome.detections = detections;
        outcome.subject_found = subject_found;
        outcome
    }

    fn store(
        &self,
        cycle: u64,
        frame: &Frame,
        annotated: Option<&Frame>,
        outcome: &mut CycleOutcome,
    ) {
        let moment = frame.captured_at;
        let mut targets = vec![(&self.archive, frame)];
        if let (Some(writer), Some(annotated)) = (self.annotated_archive.as_ref(), annotated) {
            targets.push((writer, annotated));
        }
        for (writer, image) in targets {
            match writer.store(image, moment) {
                Ok(path) => {
                    info!(cycle, path = %path.display(), "Capture stored");
                    outcome.stored.push(path);
                }
                Err(err) => {
                    warn!(cycle, stage = %CycleStage::Store, cause = %err, root = %writer.root().display(), "Storage failed");
                    outcome.storage_failures += 1;
                    outcome.record_error(CycleStage::Store, BirdwatchError::Storage(err));
                }
            }
        }
    }

    fn finish(&mut self, cycle: u64) {
        self.transition(PipelineState::Done, cycle);
        if let Some(preview) = self.preview.as_mut() {
            preview.close();
        }
        let metrics = self.source.metrics();
        info!(
            successful = metrics.successful_captures,
            failed = metrics.failed_captures,
            last_bytes = metrics.last_bytes,
            "Capture source totals"
        );
        log_run_summary(&self.stats);
    }
}

#[async_trait]
pub trait PipelineRunner {
    /// Runs until the cycle budget is spent or `shutdown` flips to `true`.
    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<CycleStats>;
}

#[async_trait]
impl<S, D> PipelineRunner for PipelineController<S, D>
where
    S: ImageSource,
    D: SubjectDetector,
{
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<CycleStats> {
        self.state = PipelineState::Idle;
        loop {
            let cycle = self.scheduler.completed() + 1;
            if self.scheduler.is_done() || *shutdown.borrow() {
                self.finish(cycle - 1);
                break;
            }

            let outcome = self.run_cycle(cycle).await;
            self.stats.record(&outcome);
            let delay = self.scheduler.record(outcome.subject_found);
            drop(outcome);

            if self.scheduler.is_done() {
                self.finish(cycle);
                break;
            }

            self.transition(PipelineState::Waiting, cycle);
            info!(cycle, next_in = ?delay, "Waiting for next capture");
            if wait_or_shutdown(delay, &mut shutdown).await {
                info!(cycle, "Shutdown requested");
                self.finish(cycle);
                break;
            }
        }
        Ok(self.stats.clone())
    }
}

/// Sleeps for `delay`; returns `true` as soon as shutdown is signalled.
/// A dropped sender means nobody can ask for shutdown any more.
async fn wait_or_shutdown(delay: std::time::Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) => {
                    if *shutdown.borrow_and_update() {
                        return true;
                    }
                }
                Err(_) => {
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use birdwatch_capture::{capture_error, ScriptedSource};
    use birdwatch_types::{
        config::{
            CameraConfig, DetectorBackendKind, DetectorConfig, OpsConfig, QualityConfig,
            ScheduleConfig, StorageConfig,
        },
        vision::{BoundingBox, Detection},
    };
    use birdwatch_vision::{annotation_error, StaticDetector};
    use chrono::{Local, TimeZone};
    use tokio::time::Instant;

    const BIRD: u32 = 14;

    fn config(dir: &Path, max_cycles: Option<u64>) -> BirdwatchConfig {
        BirdwatchConfig {
            camera: CameraConfig {
                url: "http://camera.test/capture".into(),
                timeout_secs: 1.0,
                probe_on_start: false,
            },
            quality: QualityConfig {
                sharpness_threshold: 50.0,
            },
            detector: DetectorConfig {
                backend: DetectorBackendKind::None,
                endpoint: None,
                timeout_secs: 1.0,
                target_class: Some(BIRD),
                confidence_threshold: 0.2,
                overlap_threshold: 0.5,
            },
            storage: StorageConfig {
                root: dir.join("storage").display().to_string(),
                annotated_root: dir.join("storage.cat").display().to_string(),
                ..StorageConfig::default()
            },
            schedule: ScheduleConfig {
                base_interval_secs: 5.0,
                subject_interval_secs: 1.0,
                max_cycles,
            },
            ops: OpsConfig::default(),
        }
    }

    fn moment() -> chrono::DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 5, 17, 7, 30, 15)
            .single()
            .expect("moment")
    }

    fn sharp_frame() -> Frame {
        let (w, h) = (32u32, 32u32);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let v = if (x / 2 + y / 2) % 2 == 0 { 255 } else { 0 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::from_rgb(w, h, data, moment())
    }

    fn flat_frame() -> Frame {
        Frame::from_rgb(32, 32, vec![128; 32 * 32 * 3], moment())
    }

    fn bird(confidence: f32) -> Detection {
        Detection {
            class_id: BIRD,
            confidence,
            bbox: BoundingBox::new(4.0, 14.0, 28.0, 30.0),
        }
    }

    fn controller(
        config: &BirdwatchConfig,
        frames: Vec<Result<Frame>>,
        detector: StaticDetector,
    ) -> (PipelineController<ScriptedSource, StaticDetector>, ScriptedSource) {
        let source = ScriptedSource::new(frames);
        let controller = PipelineController::new(config, source.clone(), detector)
            .expect("valid controller");
        (controller, source)
    }

    fn files_under(root: &Path) -> Vec<std::path::PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn failed_capture_skips_to_base_interval() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let detector = StaticDetector::returning(vec![bird(0.9)]);
        let (mut controller, _) = controller(
            &config,
            vec![Err(capture_error("camera answered HTTP 500"))],
            detector.clone(),
        );

        let outcome = controller.run_cycle(1).await;
        assert!(outcome.capture_failed());
        assert!(matches!(
            outcome.error.as_ref().map(|f| &f.error),
            Some(BirdwatchError::Network(_))
        ));
        assert!(outcome.frame.is_none());
        assert_eq!(detector.calls(), 0);
        assert!(files_under(dir.path()).is_empty());
        assert_eq!(
            controller.scheduler.record(outcome.subject_found),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn blurred_frame_with_subject_is_not_stored() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let (mut controller, _) = controller(
            &config,
            vec![Ok(flat_frame())],
            StaticDetector::returning(vec![bird(0.9)]),
        );

        let outcome = controller.run_cycle(1).await;
        let quality = outcome.quality.expect("assessed");
        assert!(quality.is_blurred);
        assert!(outcome.subject_found);
        assert!(outcome.stored.is_empty());
        assert!(files_under(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn sharp_frame_with_subject_is_stored_twice() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let (mut controller, _) = controller(
            &config,
            vec![Ok(sharp_frame())],
            StaticDetector::returning(vec![bird(0.9)]),
        );

        let outcome = controller.run_cycle(1).await;
        assert!(!outcome.is_blurred());
        assert!(outcome.subject_found);
        assert!(outcome.error.is_none());

        let plain = dir.path().join("storage/2024/05/17/073015.jpg");
        let annotated = dir.path().join("storage.cat/2024/05/17/073015.cat.jpg");
        assert_eq!(outcome.stored, vec![plain.clone(), annotated.clone()]);
        assert!(plain.is_file());
        assert!(annotated.is_file());
        assert_eq!(
            controller.scheduler.record(outcome.subject_found),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn annotated_copy_can_be_disabled() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = config(dir.path(), None);
        config.storage.store_annotated = false;
        let (mut controller, _) = controller(
            &config,
            vec![Ok(sharp_frame())],
            StaticDetector::returning(vec![bird(0.9)]),
        );

        let outcome = controller.run_cycle(1).await;
        assert_eq!(outcome.stored.len(), 1);
        assert!(!dir.path().join("storage.cat").exists());
    }

    #[tokio::test]
    async fn other_classes_do_not_trigger_storage() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let dog = Detection {
            class_id: 16,
            ..bird(0.95)
        };
        let (mut controller, _) = controller(
            &config,
            vec![Ok(sharp_frame())],
            StaticDetector::returning(vec![dog]),
        );

        let outcome = controller.run_cycle(1).await;
        assert!(!outcome.subject_found);
        assert_eq!(outcome.detections.len(), 1);
        assert!(files_under(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn detector_failure_counts_as_no_detections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let (mut controller, _) = controller(
            &config,
            vec![Ok(sharp_frame())],
            StaticDetector::failing("inference service down"),
        );

        let outcome = controller.run_cycle(1).await;
        assert!(!outcome.subject_found);
        assert!(outcome.quality.is_some());
        let failure = outcome.error.expect("recorded");
        assert_eq!(failure.stage, CycleStage::Detect);
        assert!(matches!(failure.error, BirdwatchError::Detector(_)));
    }

    #[tokio::test]
    async fn annotated_storage_failure_keeps_plain_copy() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        std::fs::write(dir.path().join("storage.cat"), b"in the way").expect("blocker");
        let (mut controller, _) = controller(
            &config,
            vec![Ok(sharp_frame())],
            StaticDetector::returning(vec![bird(0.9)]),
        );

        let outcome = controller.run_cycle(1).await;
        assert_eq!(outcome.stored.len(), 1);
        assert_eq!(outcome.storage_failures, 1);
        assert_eq!(
            outcome.error.as_ref().map(|f| f.stage),
            Some(CycleStage::Store)
        );
    }

    struct BrokenAnnotator;

    impl FrameAnnotator for BrokenAnnotator {
        fn annotate(&self, _frame: &Frame, _detections: &[Detection]) -> Result<Frame> {
            Err(annotation_error("font table missing"))
        }
    }

    #[tokio::test]
    async fn annotation_failure_stores_plain_copy_only() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let preview = RecordingPreview::default();
        let shown = preview.shown.clone();
        let (controller, _) = controller(
            &config,
            vec![Ok(sharp_frame())],
            StaticDetector::returning(vec![bird(0.9)]),
        );
        let mut controller = controller.with_preview(Box::new(preview));
        controller.annotator = Box::new(BrokenAnnotator);

        let outcome = controller.run_cycle(1).await;
        assert!(outcome.subject_found);
        assert_eq!(
            outcome.stored,
            vec![dir.path().join("storage/2024/05/17/073015.jpg")]
        );
        assert!(!dir.path().join("storage.cat").exists());
        let failure = outcome.error.expect("recorded");
        assert_eq!(failure.stage, CycleStage::Annotate);
        assert!(matches!(failure.error, BirdwatchError::Annotation(_)));
        assert_eq!(shown.lock().expect("lock").0, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_run_performs_exactly_n_captures() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), Some(3));
        let frames = vec![
            Ok(flat_frame()),
            Err(capture_error("timeout")),
            Ok(flat_frame()),
            Ok(flat_frame()),
        ];
        let (mut controller, source) =
            controller(&config, frames, StaticDetector::returning(Vec::new()));
        let (_tx, rx) = watch::channel(false);

        let started = Instant::now();
        let stats = controller.run(rx).await.expect("run");

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.capture_failures, 1);
        assert_eq!(source.remaining(), 1);
        assert_eq!(controller.state(), PipelineState::Done);
        let metrics = source.metrics();
        assert_eq!(metrics.successful_captures, 2);
        assert_eq!(metrics.failed_captures, 1);
        // Two waits between three cycles, none after the last one.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn subject_cycles_use_short_interval() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), Some(3));
        let frames = vec![Ok(sharp_frame()), Ok(sharp_frame()), Ok(sharp_frame())];
        let (mut controller, _) =
            controller(&config, frames, StaticDetector::returning(vec![bird(0.9)]));
        let (_tx, rx) = watch::channel(false);

        let started = Instant::now();
        let stats = controller.run(rx).await.expect("run");
        assert_eq!(stats.subject_cycles, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        // Same capture second every cycle: overwritten, not duplicated.
        assert_eq!(files_under(dir.path()).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_wait() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let frames = (0..10).map(|_| Ok(flat_frame())).collect();
        let (mut controller, source) =
            controller(&config, frames, StaticDetector::returning(Vec::new()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { controller.run(rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).expect("send shutdown");

        let stats = handle.await.expect("join").expect("run");
        assert_eq!(stats.cycles, 1);
        assert_eq!(source.remaining(), 9);
    }

    #[derive(Default)]
    struct RecordingPreview {
        shown: Arc<Mutex<(u64, bool)>>,
    }

    impl PreviewSink for RecordingPreview {
        fn show(&mut self, _frame: &Frame) -> Result<()> {
            if let Ok(mut shown) = self.shown.lock() {
                shown.0 += 1;
            }
            Ok(())
        }

        fn close(&mut self) {
            if let Ok(mut shown) = self.shown.lock() {
                shown.1 = true;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn preview_sees_every_assessed_frame_and_is_closed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), Some(2));
        let preview = RecordingPreview::default();
        let shown = preview.shown.clone();
        let (controller, _) = controller(
            &config,
            vec![Ok(flat_frame()), Ok(flat_frame())],
            StaticDetector::returning(Vec::new()),
        );
        let mut controller = controller.with_preview(Box::new(preview));
        let (_tx, rx) = watch::channel(false);

        controller.run(rx).await.expect("run");
        let shown = *shown.lock().expect("lock");
        assert_eq!(shown, (2, true));
        assert!(files_under(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn invalid_target_class_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = config(dir.path(), None);
        config.detector.target_class = Some(200);
        let result = PipelineController::new(
            &config,
            ScriptedSource::default(),
            StaticDetector::returning(Vec::new()),
        );
        assert!(matches!(result, Err(BirdwatchError::Configuration(_))));
    }

    #[tokio::test]
    async fn boot_creates_archive_roots() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(dir.path(), None);
        let (mut controller, _) =
            controller(&config, Vec::new(), StaticDetector::returning(Vec::new()));
        controller.boot(&config).await.expect("boot");
        assert!(dir.path().join("storage").is_dir());
        assert!(dir.path().join("storage.cat").is_dir());
    }
}
