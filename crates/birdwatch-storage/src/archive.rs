use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use birdwatch_types::{vision::Frame, StorageError};
use chrono::{DateTime, Datelike, Local};
use tracing::debug;

/// Where a capture taken at `moment` lives inside an archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePath {
    pub root: PathBuf,
    pub moment: DateTime<Local>,
    pub suffix: Option<String>,
}

impl ArchivePath {
    pub fn new(root: impl Into<PathBuf>, moment: DateTime<Local>, suffix: Option<&str>) -> Self {
        Self {
            root: root.into(),
            moment,
            suffix: suffix.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    pub fn directory(&self) -> PathBuf {
        self.root
            .join(format!("{:04}", self.moment.year()))
            .join(format!("{:02}", self.moment.month()))
            .join(format!("{:02}", self.moment.day()))
    }

    pub fn file_name(&self) -> String {
        let time = self.moment.format("%H%M%S");
        match &self.suffix {
            Some(suffix) => format!("{time}.{suffix}.jpg"),
            None => format!("{time}.jpg"),
        }
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.directory().join(self.file_name())
    }
}

/// Persists frames under one archive root. A second write for the same
/// second replaces the first.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    root: PathBuf,
    suffix: Option<String>,
    jpeg_quality: u8,
}

impl ArchiveWriter {
    pub fn new(root: impl Into<PathBuf>, jpeg_quality: u8) -> Self {
        Self {
            root: root.into(),
            suffix: None,
            jpeg_quality,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        self.suffix = (!suffix.is_empty()).then_some(suffix);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, moment: DateTime<Local>) -> ArchivePath {
        ArchivePath::new(&self.root, moment, self.suffix.as_deref())
    }

    pub fn store(&self, frame: &Frame, moment: DateTime<Local>) -> Result<PathBuf, StorageError> {
        let target = self.path_for(moment);
        let path = target.to_path_buf();
        let jpeg = frame
            .encode_jpeg(self.jpeg_quality)
            .map_err(|err| StorageError::Encode {
                path: path.clone(),
                message: err.to_string(),
            })?;
        self.write(&target, &jpeg)?;
        Ok(path)
    }

    /// Writes already-encoded bytes. The file appears under its final name
    /// only once it is complete; a failed write leaves nothing behind.
    pub fn write(&self, target: &ArchivePath, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let dir = target.directory();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;

        let path = target.to_path_buf();
        let write_error = |source| StorageError::Write {
            path: path.clone(),
            source,
        };
        // The staging file is removed on drop unless it was persisted.
        let mut staging = tempfile::Builder::new()
            .prefix(&format!(".{}", target.file_name()))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(write_error)?;
        staging.write_all(bytes).map_err(write_error)?;
        staging.as_file().sync_all().map_err(write_error)?;
        staging.persist(&path).map_err(|err| write_error(err.error))?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(path)
    }
}
