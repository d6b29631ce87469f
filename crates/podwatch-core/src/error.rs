use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PodwatchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no experiment directory for {date} under {root}: {reason}")]
    ExperimentNotFound {
        root: PathBuf,
        date: NaiveDate,
        reason: String,
    },

    #[error("cannot place marker {marker}: {reason}")]
    MarkerNotInExperiment { marker: PathBuf, reason: String },

    #[error("invalid directory name '{0}'")]
    InvalidDirName(String),

    #[error("basecaller failed: {0}")]
    Tool(#[from] crate::basecaller::ToolFailure),

    #[error("mail delivery failed: {0}")]
    Mail(String),

    #[error("marker index error: {0}")]
    IndexDb(String),

    #[error(transparent)]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PodwatchError {
    /// True for failures that leave the watch loop running.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            PodwatchError::ExperimentNotFound { .. } | PodwatchError::MarkerNotInExperiment { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PodwatchError>;
