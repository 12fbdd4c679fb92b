//! Recovers capture moments from archive file names, for consumers such as
//! the gallery or a migration tool.

use std::path::Path;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

const LEGACY_PREFIX: &str = "bird_";
const EXTENSION: &str = ".jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLayout {
    /// `<yyyy>/<mm>/<dd>/<HHMMSS>[.<suffix>].jpg`
    Partitioned,
    /// Flat `bird_<epoch-seconds>[<suffix>].jpg`
    LegacyEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureName {
    pub moment: NaiveDateTime,
    pub suffix: Option<String>,
    pub layout: CaptureLayout,
}

/// Parses either layout. Legacy epoch names are interpreted in local time;
/// `legacy_suffix` is the literal marker appended before `.jpg` by the old
/// annotated writer (for example `.cat`).
pub fn parse_capture_name(path: &Path, legacy_suffix: Option<&str>) -> Option<CaptureName> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(EXTENSION)?;

    if let Some(rest) = stem.strip_prefix(LEGACY_PREFIX) {
        return parse_legacy(rest, legacy_suffix);
    }
    parse_partitioned(path, stem)
}

fn parse_legacy(rest: &str, legacy_suffix: Option<&str>) -> Option<CaptureName> {
    let (digits, suffix) = match legacy_suffix.filter(|s| !s.is_empty()) {
        Some(marker) => match rest.strip_suffix(marker) {
            Some(digits) => (digits, Some(marker.trim_start_matches('.').to_string())),
            None => (rest, None),
        },
        None => (rest, None),
    };
    let epoch: i64 = digits.parse().ok()?;
    let moment = Local.timestamp_opt(epoch, 0).single()?.naive_local();
    Some(CaptureName {
        moment,
        suffix,
        layout: CaptureLayout::LegacyEpoch,
    })
}

fn parse_partitioned(path: &Path, stem: &str) -> Option<CaptureName> {
    let (time_part, suffix) = match stem.split_once('.') {
        Some((time, suffix)) if !suffix.is_empty() => (time, Some(suffix.to_string())),
        Some(_) => return None,
        None => (stem, None),
    };
    if time_part.len() != 6 || !time_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let time = NaiveTime::parse_from_str(time_part, "%H%M%S").ok()?;

    let day_dir = path.parent()?;
    let month_dir = day_dir.parent()?;
    let year_dir = month_dir.parent()?;
    let component = |p: &Path| -> Option<u32> { p.file_name()?.to_str()?.parse().ok() };
    let date = NaiveDate::from_ymd_opt(
        component(year_dir)? as i32,
        component(month_dir)?,
        component(day_dir)?,
    )?;

    Some(CaptureName {
        moment: date.and_time(time),
        suffix,
        layout: CaptureLayout::Partitioned,
    })
}
