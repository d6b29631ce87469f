use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::PodwatchError;

// ---------------------------------------------------------------------------
// BasecallMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasecallMethod {
    Simplex,
    Duplex,
}

impl BasecallMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            BasecallMethod::Simplex => "simplex",
            BasecallMethod::Duplex => "duplex",
        }
    }
}

impl fmt::Display for BasecallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BasecallMethod {
    type Err = PodwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simplex" => Ok(BasecallMethod::Simplex),
            "duplex" => Ok(BasecallMethod::Duplex),
            _ => Err(PodwatchError::Config(format!(
                "unknown basecalling method '{s}' (expected simplex or duplex)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Basecalling
// ---------------------------------------------------------------------------

/// How duplex reads are paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DuplexPairing {
    /// Let the basecaller find template/complement pairs itself.
    Auto,
    /// Use a precomputed pairs file.
    PairsFile { path: PathBuf },
}

/// The two mutually exclusive basecalling variants and the arguments each needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Basecalling {
    Simplex { model: String },
    Duplex { model: String, pairing: DuplexPairing },
}

impl Basecalling {
    pub fn method(&self) -> BasecallMethod {
        match self {
            Basecalling::Simplex { .. } => BasecallMethod::Simplex,
            Basecalling::Duplex { .. } => BasecallMethod::Duplex,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Basecalling::Simplex { model } | Basecalling::Duplex { model, .. } => model,
        }
    }
}

// ---------------------------------------------------------------------------
// InputType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Pod5,
    Fast5,
}

impl InputType {
    pub fn as_str(self) -> &'static str {
        match self {
            InputType::Pod5 => "pod5",
            InputType::Fast5 => "fast5",
        }
    }

    /// Name of the raw-signal folder the instrument writes for this input type.
    pub fn raw_folder(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InputType {
    type Err = PodwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pod5" => Ok(InputType::Pod5),
            "fast5" => Ok(InputType::Fast5),
            _ => Err(PodwatchError::Config(format!(
                "unknown input type '{s}' (expected pod5 or fast5)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentRequest
// ---------------------------------------------------------------------------

/// Everything the operator told us about the run being watched.
///
/// Built once at startup from validated configuration and shared read-only
/// by every stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentRequest {
    pub root: PathBuf,
    pub date: NaiveDate,
    pub basecalling: Basecalling,
    pub kit: String,
    pub input_type: InputType,
    pub sample_type: Option<String>,
    pub amplification: Option<String>,
    pub recipients: Vec<String>,
}

impl ExperimentRequest {
    /// The date in the `YYYYMMDD` form used in directory names.
    pub fn date_stamp(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}
