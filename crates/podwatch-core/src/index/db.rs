//! Durable storage for processing records using redb.
//!
//! A single `MARKERS` table keyed by the marker's absolute path. Values are
//! JSON-encoded [`ProcessingRecord`]s. The table is tiny (one row per
//! experiment run), so listing is a full scan.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{PodwatchError, Result};

use super::record::{ProcessingRecord, RecordStatus};

/// Key: marker path (lossy UTF-8)
/// Value: JSON-encoded ProcessingRecord
const MARKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("markers");

fn db_err(e: impl std::fmt::Display) -> PodwatchError {
    PodwatchError::IndexDb(e.to_string())
}

fn record_key(marker: &Path) -> String {
    marker.to_string_lossy().into_owned()
}

pub struct RecordDb {
    db: Database,
}

impl RecordDb {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(MARKERS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert or replace the record for its marker.
    pub fn put(&self, record: &ProcessingRecord) -> Result<()> {
        let key = record_key(&record.marker);
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(MARKERS).map_err(db_err)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// All records, oldest claim first.
    pub fn list_all(&self) -> Result<Vec<ProcessingRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(MARKERS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let record: ProcessingRecord = serde_json::from_slice(v.value())?;
            result.push(record);
        }
        result.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(result)
    }

    /// Mark every record left `Running` by a previous process as `Failed`.
    ///
    /// Returns the number of records recovered.
    pub fn startup_recovery(&self) -> Result<u32> {
        let mut count = 0u32;
        for mut record in self.list_all()? {
            if record.status == RecordStatus::Running {
                record.status = RecordStatus::Failed;
                record.finished_at = Some(Utc::now());
                record.detail = Some("interrupted by restart".into());
                self.put(&record)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
