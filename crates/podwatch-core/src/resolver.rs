//! Locates the single experiment directory for a target date.
//!
//! Walks `<root>/<date>_*` run folders, looks one and two levels down for
//! acquisition directories (see [`crate::paths`]) that carry both a
//! raw-signal folder and a completion marker, and picks one:
//! deepest first, then newest modification time, then the
//! lexicographically greatest path. The order is total, so repeated calls
//! over the same tree return the same directory.
//!
//! The pipeline does not use the date-wide pick: a marker is resolved to
//! the acquisition directory that encloses it ([`PathResolver::resolve_marker`]).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{PodwatchError, Result};
use crate::paths::{self, AcquisitionDirName, RunFolderName};
use crate::types::InputType;

/// An acquisition directory that satisfied every naming and content rule.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub name: AcquisitionDirName,
    pub depth: usize,
    pub modified: SystemTime,
}

impl Candidate {
    fn sort_key(&self) -> (usize, SystemTime, &Path) {
        (self.depth, self.modified, &self.path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub experiment_dir: PathBuf,
    pub raw_dir: PathBuf,
    pub device_id: String,
    pub flow_cell_id: String,
    pub experiment_id: String,
    /// Other qualifying directories that lost the tie-break.
    pub discarded: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct PathResolver {
    input_type: InputType,
}

impl PathResolver {
    pub fn new(input_type: InputType) -> Self {
        Self { input_type }
    }

    /// Resolve the experiment directory for `date` under `root`.
    pub fn resolve(&self, root: &Path, date: NaiveDate) -> Result<Resolution> {
        let mut candidates = self.candidates(root, date)?;
        candidates.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));

        let mut iter = candidates.into_iter();
        let Some(chosen) = iter.next() else {
            return Err(not_found(
                root,
                date,
                format!(
                    "no acquisition directory with a '{}' folder and a {}*{} marker",
                    self.input_type.raw_folder(),
                    paths::MARKER_PREFIX,
                    paths::MARKER_EXTENSION
                ),
            ));
        };
        let discarded: Vec<PathBuf> = iter.map(|c| c.path).collect();
        for alt in &discarded {
            tracing::info!(
                chosen = %chosen.path.display(),
                discarded = %alt.display(),
                "multiple experiment directories match; keeping the newest"
            );
        }

        Ok(Resolution {
            raw_dir: chosen.path.join(self.input_type.raw_folder()),
            device_id: chosen.name.device_id,
            flow_cell_id: chosen.name.flow_cell_id,
            experiment_id: chosen.name.experiment_id,
            experiment_dir: chosen.path,
            discarded,
        })
    }

    /// Resolve the acquisition directory that encloses `marker`.
    ///
    /// Each marker belongs to its own run, so this never applies the
    /// date-wide tie-break: two flow cells finishing on the same day resolve
    /// to their own directories. The enclosing directory must sit one or two
    /// levels under a run folder for `date`, carry an acquisition name for
    /// `date`, and hold the raw-signal folder.
    pub fn resolve_marker(&self, root: &Path, date: NaiveDate, marker: &Path) -> Result<Resolution> {
        let rejected = |reason: String| PodwatchError::MarkerNotInExperiment {
            marker: marker.to_path_buf(),
            reason,
        };
        let stamp = date.format("%Y%m%d");

        let rel = marker
            .strip_prefix(root)
            .map_err(|_| rejected(format!("not under {}", root.display())))?;
        let run_name = rel
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .unwrap_or_default();
        if !RunFolderName::parse(run_name).is_ok_and(|run| run.date == date) {
            return Err(rejected(format!("not inside a {stamp}_* run folder")));
        }
        let run_dir = root.join(run_name);

        let Some((dir, name)) = marker
            .ancestors()
            .skip(1)
            .take_while(|a| *a != run_dir)
            .find_map(|a| {
                paths::dir_name(a)
                    .and_then(|n| AcquisitionDirName::parse(n).ok())
                    .map(|name| (a, name))
            })
        else {
            return Err(rejected("no enclosing acquisition directory".into()));
        };

        let depth = dir
            .strip_prefix(&run_dir)
            .map(|p| p.components().count())
            .unwrap_or(usize::MAX);
        if depth > 2 {
            return Err(rejected(format!(
                "{} is more than two levels below its run folder",
                dir.display()
            )));
        }
        if name.date != date {
            return Err(rejected(format!(
                "{} is not an acquisition from {stamp}",
                dir.display()
            )));
        }
        let raw_dir = dir.join(self.input_type.raw_folder());
        if !raw_dir.is_dir() {
            return Err(rejected(format!(
                "{} has no '{}' folder",
                dir.display(),
                self.input_type.raw_folder()
            )));
        }

        Ok(Resolution {
            experiment_dir: dir.to_path_buf(),
            raw_dir,
            device_id: name.device_id,
            flow_cell_id: name.flow_cell_id,
            experiment_id: name.experiment_id,
            discarded: Vec::new(),
        })
    }

    /// Every qualifying acquisition directory for `date`, unordered.
    pub fn candidates(&self, root: &Path, date: NaiveDate) -> Result<Vec<Candidate>> {
        let run_folders = run_folders(root, date)?;
        if run_folders.is_empty() {
            return Err(not_found(
                root,
                date,
                format!("no run folder named {}_*", date.format("%Y%m%d")),
            ));
        }

        let mut found = Vec::new();
        for run in &run_folders {
            for entry in WalkDir::new(run)
                .min_depth(1)
                .max_depth(2)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
            {
                let path = entry.path();
                let Some(name) = paths::dir_name(path) else {
                    continue;
                };
                let Ok(acq) = AcquisitionDirName::parse(name) else {
                    continue;
                };
                if acq.date != date {
                    tracing::debug!(dir = %path.display(), "acquisition date differs; skipping");
                    continue;
                }
                if !path.join(self.input_type.raw_folder()).is_dir() {
                    tracing::debug!(dir = %path.display(), "no raw-signal folder yet");
                    continue;
                }
                if !paths::has_marker(path) {
                    tracing::debug!(dir = %path.display(), "no completion marker yet");
                    continue;
                }
                let modified = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push(Candidate {
                    path: path.to_path_buf(),
                    name: acq,
                    depth: entry.depth(),
                    modified,
                });
            }
        }
        Ok(found)
    }
}

/// Immediate subdirectories of `root` named `<date>_<description>`, sorted.
fn run_folders(root: &Path, date: NaiveDate) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let matches = paths::dir_name(&path)
            .and_then(|n| RunFolderName::parse(n).ok())
            .is_some_and(|run| run.date == date);
        if matches {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn not_found(root: &Path, date: NaiveDate, reason: String) -> PodwatchError {
    PodwatchError::ExperimentNotFound {
        root: root.to_path_buf(),
        date,
        reason,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
