use crate::output::{print_json, print_table};
use anyhow::{anyhow, Context};
use podwatch_core::config::PartialConfig;
use podwatch_core::index::{ProcessingRecord, RecordDb};
use podwatch_core::paths::default_index_path;
use std::path::{Path, PathBuf};

/// Print the records of a durable index. The index is opened read-mostly:
/// no recovery pass runs, so a record still `running` here may belong to a
/// live `podwatch watch`.
pub fn run(
    config_file: Option<&Path>,
    index: Option<&Path>,
    root: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let index_path = locate_index(config_file, index, root)?;

    let records: Vec<ProcessingRecord> = if index_path.exists() {
        RecordDb::open(&index_path)
            .with_context(|| {
                format!(
                    "cannot open {} (is `podwatch watch` still running?)",
                    index_path.display()
                )
            })?
            .list_all()?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("no markers recorded in {}", index_path.display());
        return Ok(());
    }

    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.status.to_string(),
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.finished_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into()),
                r.marker.display().to_string(),
                r.detail.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["STATUS", "STARTED", "FINISHED", "MARKER", "DETAIL"], rows);
    Ok(())
}

/// `--index`, then the config file's `index.path`, then the default location
/// under `--path` or the config file's `path`.
fn locate_index(
    config_file: Option<&Path>,
    index: Option<&Path>,
    root: Option<&Path>,
) -> anyhow::Result<PathBuf> {
    if let Some(index) = index {
        return Ok(index.to_path_buf());
    }
    let file = match config_file {
        Some(path) => PartialConfig::load(path)?,
        None => PartialConfig::default(),
    };
    if let Some(path) = file.index.path {
        return Ok(path);
    }
    root.map(Path::to_path_buf)
        .or(file.path)
        .map(|r| default_index_path(&r))
        .ok_or_else(|| anyhow!("pass --index or --path to locate the marker index"))
}
