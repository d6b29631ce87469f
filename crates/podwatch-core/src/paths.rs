//! Naming rules for the instrument's output tree.
//!
//! The instrument writes runs as:
//!
//! ```text
//! <root>/<YYYYMMDD>_<description>/[<sample>/]<YYYYMMDD>_<HHMM>_<device>_<flow cell>_<experiment id>/
//!     pod5/                     raw-signal folder
//!     final_summary_*.txt       completion marker
//! ```
//!
//! Each level is parsed into a named struct so resolution fails on a
//! concrete rule rather than a loose substring match.

use crate::error::{PodwatchError, Result};
use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MARKER_PREFIX: &str = "final_summary";
pub const MARKER_EXTENSION: &str = ".txt";

pub const STATE_DIR: &str = ".podwatch";
pub const INDEX_FILE: &str = ".podwatch/markers.redb";

pub fn default_index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILE)
}

// ---------------------------------------------------------------------------
// Marker files
// ---------------------------------------------------------------------------

/// True when `name` is a completion marker: `final_summary*.txt`, case-sensitive.
pub fn is_marker_name(name: &str) -> bool {
    name.starts_with(MARKER_PREFIX) && name.ends_with(MARKER_EXTENSION)
}

pub fn is_marker_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_marker_name)
}

/// True when `dir` directly contains at least one marker file.
pub fn has_marker(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.file_type().is_ok_and(|t| t.is_file()) && is_marker_path(&e.path()))
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse an 8-digit `YYYYMMDD` stamp into a calendar day.
pub fn parse_date_stamp(stamp: &str) -> Result<NaiveDate> {
    if stamp.len() != 8 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PodwatchError::Config(format!(
            "date '{stamp}' must be 8 digits in YYYYMMDD form"
        )));
    }
    NaiveDate::parse_from_str(stamp, "%Y%m%d")
        .map_err(|_| PodwatchError::Config(format!("date '{stamp}' is not a real calendar day")))
}

// ---------------------------------------------------------------------------
// RunFolderName: <YYYYMMDD>_<description>
// ---------------------------------------------------------------------------

static RUN_FOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn run_folder_re() -> &'static Regex {
    RUN_FOLDER_RE.get_or_init(|| Regex::new(r"^(\d{8})_(.+)$").unwrap())
}

/// Top-level folder the operator creates for a day's experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFolderName {
    pub date: NaiveDate,
    pub description: String,
}

impl RunFolderName {
    pub fn parse(name: &str) -> Result<Self> {
        let caps = run_folder_re()
            .captures(name)
            .ok_or_else(|| PodwatchError::InvalidDirName(name.to_string()))?;
        let date = NaiveDate::parse_from_str(&caps[1], "%Y%m%d")
            .map_err(|_| PodwatchError::InvalidDirName(name.to_string()))?;
        Ok(Self {
            date,
            description: caps[2].to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// AcquisitionDirName: <YYYYMMDD>_<HHMM>_<device>_<flow cell>_<experiment id>
// ---------------------------------------------------------------------------

static ACQUISITION_RE: OnceLock<Regex> = OnceLock::new();

fn acquisition_re() -> &'static Regex {
    ACQUISITION_RE.get_or_init(|| {
        Regex::new(r"^(\d{8})_(\d{4})_([A-Za-z0-9-]+)_([A-Za-z0-9-]+)_([A-Za-z0-9-]+)$").unwrap()
    })
}

/// The per-flow-cell directory the instrument writes raw data into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionDirName {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub device_id: String,
    pub flow_cell_id: String,
    pub experiment_id: String,
}

impl AcquisitionDirName {
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || PodwatchError::InvalidDirName(name.to_string());
        let caps = acquisition_re().captures(name).ok_or_else(invalid)?;
        let date = NaiveDate::parse_from_str(&caps[1], "%Y%m%d").map_err(|_| invalid())?;
        let time = NaiveTime::parse_from_str(&caps[2], "%H%M").map_err(|_| invalid())?;
        Ok(Self {
            date,
            time,
            device_id: caps[3].to_string(),
            flow_cell_id: caps[4].to_string(),
            experiment_id: caps[5].to_string(),
        })
    }
}

/// Final path component as UTF-8, if any.
pub fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_names() {
        for name in ["final_summary.txt", "final_summary_FAX123_abc.txt"] {
            assert!(is_marker_name(name), "expected marker: {name}");
        }
        for name in [
            "Final_summary_x.txt",
            "final_summary_x.json",
            "sequencing_summary_x.txt",
            "x_final_summary.txt",
        ] {
            assert!(!is_marker_name(name), "expected non-marker: {name}");
        }
    }

    #[test]
    fn date_stamps() {
        assert_eq!(
            parse_date_stamp("20240401").unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
        );
        for bad in ["2024041", "2024-04-01", "20241301", "20240230", "abcdefgh"] {
            assert!(parse_date_stamp(bad).is_err(), "expected invalid: {bad}");
        }
    }

    #[test]
    fn run_folder_names() {
        let run = RunFolderName::parse("20240401_run1").unwrap();
        assert_eq!(run.date, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(run.description, "run1");

        let spaced = RunFolderName::parse("20240401_gut sample 3").unwrap();
        assert_eq!(spaced.description, "gut sample 3");

        assert!(RunFolderName::parse("run1").is_err());
        assert!(RunFolderName::parse("20240401").is_err());
        assert!(RunFolderName::parse("20241399_bad").is_err());
    }

    #[test]
    fn acquisition_dir_names() {
        let acq = AcquisitionDirName::parse("20240401_1200_devA_fcB_expC").unwrap();
        assert_eq!(acq.date, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(acq.time, NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        assert_eq!(acq.device_id, "devA");
        assert_eq!(acq.flow_cell_id, "fcB");
        assert_eq!(acq.experiment_id, "expC");

        let minknow = AcquisitionDirName::parse("20240401_0931_MN12345_FAX12345_a1b2c3d4").unwrap();
        assert_eq!(minknow.device_id, "MN12345");

        for bad in [
            "20240401_run1",
            "20240401_1200_devA_fcB",
            "20240401_2561_devA_fcB_expC",
            "20240401_1200_devA_fcB_expC_extra",
        ] {
            assert!(AcquisitionDirName::parse(bad).is_err(), "expected invalid: {bad}");
        }
    }

    #[test]
    fn has_marker_requires_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(!has_marker(dir.path()));
        std::fs::create_dir(dir.path().join("final_summary_dir.txt")).unwrap();
        assert!(!has_marker(dir.path()));
        std::fs::write(dir.path().join("final_summary_x.txt"), "done").unwrap();
        assert!(has_marker(dir.path()));
    }

    #[test]
    fn default_index_lives_under_root() {
        assert_eq!(
            default_index_path(Path::new("/data")),
            PathBuf::from("/data/.podwatch/markers.redb")
        );
    }
}
