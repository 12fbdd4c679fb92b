use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{taxonomy, BirdwatchError, Result};

pub const ENV_CONFIG_PATH: &str = "BIRDWATCH_CONFIG";

/// Upper bound for every timeout and interval setting.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub url: String,
    #[serde(default = "default_camera_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_true")]
    pub probe_on_start: bool,
}

impl CameraConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_sharpness_threshold")]
    pub sharpness_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackendKind {
    #[default]
    Remote,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub backend: DetectorBackendKind,
    pub endpoint: Option<String>,
    #[serde(default = "default_detector_timeout")]
    pub timeout_secs: f64,
    /// Required. There is deliberately no default class.
    pub target_class: Option<u32>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f32,
}

impl DetectorConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }

    /// Target class after validation; errors when unset or outside the taxonomy.
    pub fn target(&self) -> Result<u32> {
        let class_id = self.target_class.ok_or_else(|| {
            BirdwatchError::Configuration("detector.target_class must be set".into())
        })?;
        if !taxonomy::is_known_class(class_id) {
            return Err(BirdwatchError::Configuration(format!(
                "detector.target_class {class_id} is outside the known taxonomy (0..{})",
                taxonomy::COCO_CLASSES.len()
            )));
        }
        Ok(class_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_annotated_root")]
    pub annotated_root: String,
    #[serde(default = "default_annotated_suffix")]
    pub annotated_suffix: String,
    #[serde(default = "default_true")]
    pub store_annotated: bool,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: f64,
    #[serde(default = "default_subject_interval")]
    pub subject_interval_secs: f64,
    pub max_cycles: Option<u64>,
}

impl ScheduleConfig {
    pub fn base_interval(&self) -> Duration {
        seconds(self.base_interval_secs)
    }

    pub fn subject_interval(&self) -> Duration {
        seconds(self.subject_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub verbose: bool,
    pub preview_path: Option<String>,
}

impl OpsConfig {
    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirdwatchConfig {
    pub camera: CameraConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    pub detector: DetectorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub ops: OpsConfig,
}

impl BirdwatchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            BirdwatchError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        Self::from_toml(&contents).map_err(|err| {
            BirdwatchError::Configuration(format!("{} ({})", err, path_ref.display()))
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| {
            BirdwatchError::Configuration(format!("failed to parse config: {err}"))
        })
    }

    /// Applies `BIRDWATCH_*` overrides from the given variables.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "BIRDWATCH_CAMERA_URL" => self.camera.url = value.to_string(),
                "BIRDWATCH_TARGET_CLASS" => {
                    self.detector.target_class = Some(parse_env(key.as_ref(), value)?)
                }
                "BIRDWATCH_SHARPNESS_THRESHOLD" => {
                    self.quality.sharpness_threshold = parse_env(key.as_ref(), value)?
                }
                "BIRDWATCH_STORAGE_ROOT" => self.storage.root = value.to_string(),
                "BIRDWATCH_MAX_CYCLES" => {
                    self.schedule.max_cycles = Some(parse_env(key.as_ref(), value)?)
                }
                "BIRDWATCH_VERBOSE" => self.ops.verbose = parse_env(key.as_ref(), value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.camera.url).map_err(|err| {
            BirdwatchError::Configuration(format!(
                "camera.url '{}' is not a valid URL: {err}",
                self.camera.url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(BirdwatchError::Configuration(format!(
                "camera.url '{}' must be an http(s) URL with a host",
                self.camera.url
            )));
        }
        checked_duration("camera.timeout_secs", self.camera.timeout_secs)?;
        if !(self.quality.sharpness_threshold >= 0.0 && self.quality.sharpness_threshold.is_finite())
        {
            return Err(BirdwatchError::Configuration(
                "quality.sharpness_threshold must be a finite, non-negative number".into(),
            ));
        }
        self.detector.target()?;
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(BirdwatchError::Configuration(
                "detector.confidence_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.overlap_threshold) {
            return Err(BirdwatchError::Configuration(
                "detector.overlap_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if self.detector.backend == DetectorBackendKind::Remote {
            let endpoint = self.detector.endpoint.as_deref().ok_or_else(|| {
                BirdwatchError::Configuration(
                    "detector.endpoint is required for the remote backend".into(),
                )
            })?;
            Url::parse(endpoint).map_err(|err| {
                BirdwatchError::Configuration(format!(
                    "detector.endpoint '{endpoint}' is not a valid URL: {err}"
                ))
            })?;
        }
        checked_duration("detector.timeout_secs", self.detector.timeout_secs)?;
        if self.storage.root.trim().is_empty() {
            return Err(BirdwatchError::Configuration(
                "storage.root must not be empty".into(),
            ));
        }
        if self.storage.store_annotated {
            if self.storage.annotated_root.trim().is_empty() {
                return Err(BirdwatchError::Configuration(
                    "storage.annotated_root must not be empty".into(),
                ));
            }
            if self.storage.annotated_root == self.storage.root
                && self.storage.annotated_suffix.is_empty()
            {
                return Err(BirdwatchError::Configuration(
                    "annotated copies sharing storage.root need a storage.annotated_suffix".into(),
                ));
            }
        }
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            return Err(BirdwatchError::Configuration(
                "storage.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        checked_duration("schedule.base_interval_secs", self.schedule.base_interval_secs)?;
        checked_duration(
            "schedule.subject_interval_secs",
            self.schedule.subject_interval_secs,
        )?;
        if self.schedule.max_cycles == Some(0) {
            return Err(BirdwatchError::Configuration(
                "schedule.max_cycles must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Converts validated seconds; out-of-range input saturates instead of panicking.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DURATION_SECS)).unwrap_or_default()
}

fn checked_duration(name: &str, secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() && secs <= MAX_DURATION_SECS => Ok(duration),
        _ => Err(BirdwatchError::Configuration(format!(
            "{name} must be greater than zero and at most {MAX_DURATION_SECS} seconds, got {secs}"
        ))),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err| {
        BirdwatchError::Configuration(format!("invalid value '{value}' for {key}: {err}"))
    })
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sharpness_threshold: default_sharpness_threshold(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            annotated_root: default_annotated_root(),
            annotated_suffix: default_annotated_suffix(),
            store_annotated: true,
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval(),
            subject_interval_secs: default_subject_interval(),
            max_cycles: None,
        }
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            verbose: false,
            preview_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_camera_timeout() -> f64 {
    5.0
}

fn default_detector_timeout() -> f64 {
    10.0
}

fn default_sharpness_threshold() -> f64 {
    100.0
}

fn default_confidence_threshold() -> f32 {
    0.2
}

fn default_overlap_threshold() -> f32 {
    0.5
}

fn default_storage_root() -> String {
    "storage".into()
}

fn default_annotated_root() -> String {
    "storage.cat".into()
}

fn default_annotated_suffix() -> String {
    "cat".into()
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_base_interval() -> f64 {
    5.0
}

fn default_subject_interval() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".into()
}
