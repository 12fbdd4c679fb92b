use std::time::Duration;

use birdwatch_types::config::ScheduleConfig;

/// Picks the pause before the next capture and enforces the optional cycle
/// budget. The last-outcome flag is the only state carried across cycles.
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    base_interval: Duration,
    subject_interval: Duration,
    max_cycles: Option<u64>,
    completed: u64,
    last_subject_found: bool,
}

impl AdaptiveScheduler {
    pub fn new(base_interval: Duration, subject_interval: Duration, max_cycles: Option<u64>) -> Self {
        Self {
            base_interval,
            subject_interval,
            max_cycles,
            completed: 0,
            last_subject_found: false,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(
            config.base_interval(),
            config.subject_interval(),
            config.max_cycles,
        )
    }

    pub fn is_done(&self) -> bool {
        self.max_cycles
            .map(|max| self.completed >= max)
            .unwrap_or(false)
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Records a finished cycle and returns the interval to wait before the
    /// next one.
    pub fn record(&mut self, subject_found: bool) -> Duration {
        self.completed += 1;
        self.last_subject_found = subject_found;
        self.next_interval()
    }

    pub fn next_interval(&self) -> Duration {
        if self.last_subject_found {
            self.subject_interval
        } else {
            self.base_interval
        }
    }
}
