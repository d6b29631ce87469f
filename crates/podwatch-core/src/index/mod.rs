//! The claim gate that keeps each completion marker to one basecalling run.
//!
//! `MarkerIndex` owns the table of marker path → [`ProcessingRecord`]. Every
//! discovery source (startup backlog scan, live filesystem events) calls
//! [`MarkerIndex::try_claim`], and only the first call for a path wins.
//!
//! With a [`RecordDb`] attached, every transition is written through before
//! the call returns, so a restarted process sees what the previous one did.
//! Without one the table lives for the process only.

pub mod db;
pub mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{PodwatchError, Result};

pub use db::RecordDb;
pub use record::{Outcome, ProcessingRecord, RecordStatus};

pub struct MarkerIndex {
    records: Mutex<HashMap<PathBuf, ProcessingRecord>>,
    db: Option<RecordDb>,
}

impl MarkerIndex {
    /// A per-process index. Restart safety then relies on the backlog scan.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            db: None,
        }
    }

    /// Open a durable index at `path`, recovering records interrupted by a
    /// previous crash.
    pub fn open(path: &Path) -> Result<Self> {
        let db = RecordDb::open(path)?;
        let recovered = db.startup_recovery()?;
        if recovered > 0 {
            tracing::warn!(recovered, "marked interrupted basecalling runs as failed");
        }
        let records = db
            .list_all()?
            .into_iter()
            .map(|r| (r.marker.clone(), r))
            .collect();
        Ok(Self {
            records: Mutex::new(records),
            db: Some(db),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.db.is_some()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, ProcessingRecord>>> {
        self.records
            .lock()
            .map_err(|_| PodwatchError::IndexDb("marker table lock poisoned".into()))
    }

    /// Claim `marker` for processing.
    ///
    /// Returns `true` and records `Running` the first time a path is seen;
    /// `false` on every later call. The check and the write happen under one
    /// lock, so two sources racing on the same path cannot both win.
    pub fn try_claim(&self, marker: &Path) -> Result<bool> {
        let mut records = self.lock()?;
        if let Some(existing) = records.get(marker) {
            if !existing.status.is_claimable() {
                return Ok(false);
            }
        }
        let record = ProcessingRecord::running(marker.to_path_buf());
        if let Some(db) = &self.db {
            db.put(&record)?;
        }
        records.insert(marker.to_path_buf(), record);
        Ok(true)
    }

    /// Move a claimed marker to its terminal state. Calling it again, or on a
    /// marker that was never claimed, changes nothing.
    pub fn complete(&self, marker: &Path, outcome: &Outcome) -> Result<()> {
        let mut records = self.lock()?;
        let Some(record) = records.get_mut(marker) else {
            tracing::debug!(marker = %marker.display(), "complete called for unclaimed marker");
            return Ok(());
        };
        if record.status != RecordStatus::Running {
            return Ok(());
        }
        let mut updated = record.clone();
        updated.finish(outcome);
        if let Some(db) = &self.db {
            db.put(&updated)?;
        }
        *record = updated;
        Ok(())
    }

    pub fn get(&self, marker: &Path) -> Result<Option<ProcessingRecord>> {
        Ok(self.lock()?.get(marker).cloned())
    }

    /// All known records, oldest claim first.
    pub fn records(&self) -> Result<Vec<ProcessingRecord>> {
        let mut all: Vec<_> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
