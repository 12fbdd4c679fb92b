use serde::{Deserialize, Serialize};

use crate::outcome::CycleOutcome;

/// Running counters over every completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub capture_failures: u64,
    pub blurred: u64,
    pub subject_cycles: u64,
    pub stored_captures: u64,
    pub storage_failures: u64,
}

impl CycleStats {
    pub fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        if outcome.capture_failed() {
            self.capture_failures += 1;
        }
        if outcome.is_blurred() {
            self.blurred += 1;
        }
        if outcome.subject_found {
            self.subject_cycles += 1;
        }
        self.stored_captures += outcome.stored.len() as u64;
        self.storage_failures += outcome.storage_failures as u64;
    }
}
