//! Processing record for one completion marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// RecordStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a marker.
///
/// Transitions: `Pending → Running → Succeeded | Failed`
///
/// `Running` is written *before* the basecaller starts. On restart, any
/// record still `Running` is recovered to `Failed` by `startup_recovery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Running => "running",
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Failed => "failed",
        }
    }

    /// A marker in this state may be claimed.
    pub fn is_claimable(self) -> bool {
        matches!(self, RecordStatus::Pending)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecordStatus::Succeeded | RecordStatus::Failed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a claimed marker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { detail: String },
    Failed { detail: String },
}

impl Outcome {
    pub fn status(&self) -> RecordStatus {
        match self {
            Outcome::Succeeded { .. } => RecordStatus::Succeeded,
            Outcome::Failed { .. } => RecordStatus::Failed,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Outcome::Succeeded { detail } | Outcome::Failed { detail } => detail,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessingRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub marker: PathBuf,
    pub status: RecordStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProcessingRecord {
    /// A freshly claimed record.
    pub fn running(marker: PathBuf) -> Self {
        Self {
            marker,
            status: RecordStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            detail: None,
        }
    }

    pub fn finish(&mut self, outcome: &Outcome) {
        self.status = outcome.status();
        self.finished_at = Some(Utc::now());
        self.detail = Some(outcome.detail().to_string());
    }
}
