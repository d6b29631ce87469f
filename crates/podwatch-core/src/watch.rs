//! Marker discovery: the startup backlog scan and the live filesystem watch.
//!
//! Both sources produce [`MarkerEvent`]s and leave deduplication to the
//! claim gate in [`crate::index`].

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::Result;
use crate::paths::{is_marker_path, STATE_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    BacklogScan,
    LiveEvent,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::BacklogScan => "pre-existing backlog",
            Origin::LiveEvent => "live filesystem event",
        })
    }
}

/// One sighting of a completion marker.
#[derive(Debug, Clone, Serialize)]
pub struct MarkerEvent {
    pub marker: PathBuf,
    /// Directory holding the marker until resolution replaces it with the
    /// authoritative experiment directory.
    pub experiment_dir: Option<PathBuf>,
    pub discovered_at: DateTime<Utc>,
    pub origin: Origin,
}

impl MarkerEvent {
    pub fn new(marker: PathBuf, origin: Origin) -> Self {
        let experiment_dir = marker.parent().map(Path::to_path_buf);
        Self {
            marker,
            experiment_dir,
            discovered_at: Utc::now(),
            origin,
        }
    }
}

/// Every marker already under `root`, in path order.
///
/// Unreadable entries are logged and skipped; the state directory is not
/// descended into.
pub fn scan_backlog(root: &Path) -> Vec<MarkerEvent> {
    let mut markers: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != STATE_DIR)
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                tracing::warn!("backlog scan: {err}");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && is_marker_path(e.path()))
        .map(|e| e.into_path())
        .collect();
    markers.sort();
    markers
        .into_iter()
        .map(|m| MarkerEvent::new(m, Origin::BacklogScan))
        .collect()
}

fn is_relevant(event: &Event) -> bool {
    match event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Start a recursive watch on `root` that forwards marker sightings to `tx`.
///
/// The watch stops when the returned watcher is dropped. The callback runs
/// on the watcher's own thread and blocks when the queue is full.
pub fn spawn_watcher(root: &Path, tx: mpsc::Sender<MarkerEvent>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("filesystem watch error: {err}");
                return;
            }
        };
        if !is_relevant(&event) {
            return;
        }
        for path in event.paths {
            if !is_marker_path(&path) || !path.is_file() {
                continue;
            }
            tracing::debug!(marker = %path.display(), kind = ?event.kind, "marker event");
            if tx.blocking_send(MarkerEvent::new(path, Origin::LiveEvent)).is_err() {
                // consumer gone; shutting down
                return;
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), "watching for completion markers");
    Ok(watcher)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
