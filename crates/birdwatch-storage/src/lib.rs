//! Date-partitioned capture archive.
//!
//! Layout: `<root>/<yyyy>/<mm>/<dd>/<HHMMSS>[.<suffix>].jpg`, keyed by the
//! capture moment rather than the write time.

mod archive;
mod naming;

pub use archive::{ArchivePath, ArchiveWriter};
pub use naming::{parse_capture_name, CaptureName, CaptureLayout};
