use std::{fs, path::PathBuf};

use birdwatch_types::{vision::Frame, BirdwatchError, Result};
use tracing::debug;

/// Receives the annotated frame of every cycle. Has no say in what gets
/// archived.
pub trait PreviewSink: Send {
    fn show(&mut self, frame: &Frame) -> Result<()>;

    fn close(&mut self) {}
}

/// Keeps a single JPEG on disk up to date with the latest annotated frame.
pub struct SnapshotPreview {
    path: PathBuf,
    jpeg_quality: u8,
    frames_shown: u64,
}

impl SnapshotPreview {
    pub fn new(path: impl Into<PathBuf>, jpeg_quality: u8) -> Self {
        Self {
            path: path.into(),
            jpeg_quality,
            frames_shown: 0,
        }
    }
}

impl PreviewSink for SnapshotPreview {
    fn show(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = frame
            .encode_jpeg(self.jpeg_quality)
            .map_err(|err| BirdwatchError::Ops(format!("preview encode failed: {err}")))?;
        let staging = self.path.with_extension("tmp");
        if let Err(err) = fs::write(&staging, jpeg).and_then(|_| fs::rename(&staging, &self.path)) {
            let _ = fs::remove_file(&staging);
            return Err(BirdwatchError::Ops(format!(
                "preview write to {:?} failed: {err}",
                self.path
            )));
        }
        self.frames_shown += 1;
        Ok(())
    }

    fn close(&mut self) {
        debug!(
            "Closing preview {:?} after {} frames",
            self.path, self.frames_shown
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn snapshot_preview_overwrites_single_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("preview.jpg");
        let mut preview = SnapshotPreview::new(&path, 80);
        let frame = Frame::from_rgb(4, 4, vec![9; 48], Local::now());

        preview.show(&frame).expect("first");
        preview.show(&frame).expect("second");
        preview.close();

        assert!(path.is_file());
        assert_eq!(preview.frames_shown, 2);
        assert_eq!(fs::read_dir(dir.path()).expect("read").count(), 1);
    }
}
