use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a malware scan. Only `is_infected` drives the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub is_infected: bool,
    pub viruses: Vec<String>,
    pub scan_time: DateTime<Utc>,
}

impl ScanResult {
    pub fn clean() -> Self {
        Self {
            is_infected: false,
            viruses: Vec::new(),
            scan_time: Utc::now(),
        }
    }

    pub fn infected(viruses: Vec<String>) -> Self {
        Self {
            is_infected: true,
            viruses,
            scan_time: Utc::now(),
        }
    }
}
