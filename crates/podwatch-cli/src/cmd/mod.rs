pub mod config;
pub mod resolve;
pub mod status;
pub mod watch;

use anyhow::Context;
use clap::Args;
use podwatch_core::config::{PartialConfig, WatchConfig};
use podwatch_core::types::{BasecallMethod, InputType};
use std::path::{Path, PathBuf};

/// Flags shared by every command that needs an experiment request. Each one
/// overrides the matching key of the configuration file.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Root directory the sequencer writes runs into
    #[arg(long, short = 'p', env = "PODWATCH_PATH")]
    pub path: Option<PathBuf>,

    /// Run date to watch for (YYYYMMDD)
    #[arg(long, short = 'd')]
    pub date: Option<String>,

    /// Basecalling method: simplex or duplex
    #[arg(long, short = 'm')]
    pub method: Option<BasecallMethod>,

    /// Basecalling model (e.g. fast, hac, sup)
    #[arg(long)]
    pub model: Option<String>,

    /// Read-pairs file for duplex basecalling (default: automatic pairing)
    #[arg(long)]
    pub duplex_pairs: Option<PathBuf>,

    /// Sequencing kit name
    #[arg(long, short = 'k')]
    pub kit_name: Option<String>,

    /// Raw signal format: pod5 or fast5
    #[arg(long)]
    pub input_type: Option<InputType>,

    /// Sample type, quoted in the notification
    #[arg(long)]
    pub sample_type: Option<String>,

    /// Amplification method, quoted in the notification
    #[arg(long)]
    pub amplification: Option<String>,

    /// Notification recipient; repeat or separate with commas
    #[arg(long = "email", short = 'e', value_delimiter = ',')]
    pub emails: Vec<String>,

    /// Basecaller executable
    #[arg(long)]
    pub tool_binary: Option<String>,

    /// Extra basecaller argument; repeatable
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    pub tool_args: Vec<String>,

    /// Kill the basecaller after this many minutes
    #[arg(long)]
    pub timeout_minutes: Option<u64>,

    /// Log notifications instead of sending them
    #[arg(long)]
    pub no_mail: bool,

    /// Keep the marker index in memory only
    #[arg(long)]
    pub in_memory_index: bool,

    /// Durable index location (default: <path>/.podwatch/markers.redb)
    #[arg(long)]
    pub index_path: Option<PathBuf>,

    /// Queued markers allowed while one is being processed
    #[arg(long)]
    pub queue_capacity: Option<usize>,
}

impl ConfigArgs {
    fn into_partial(self) -> PartialConfig {
        let mut partial = PartialConfig {
            path: self.path,
            date: self.date,
            basecalling_method: self.method,
            model: self.model,
            duplex_pairs: self.duplex_pairs,
            kit_name: self.kit_name,
            input_type: self.input_type,
            sample_type: self.sample_type,
            amplification: self.amplification,
            email_recipients: (!self.emails.is_empty()).then_some(self.emails),
            queue_capacity: self.queue_capacity,
            ..PartialConfig::default()
        };
        partial.tool.binary = self.tool_binary;
        partial.tool.extra_args = (!self.tool_args.is_empty()).then_some(self.tool_args);
        partial.tool.timeout_minutes = self.timeout_minutes;
        if self.no_mail {
            partial.mail.enabled = Some(false);
        }
        if self.in_memory_index {
            partial.index.durable = Some(false);
        }
        partial.index.path = self.index_path;
        partial
    }
}

/// The configuration file (if any) overlaid with command-line flags.
pub fn layered(config_file: Option<&Path>, args: ConfigArgs) -> anyhow::Result<PartialConfig> {
    let base = match config_file {
        Some(path) => PartialConfig::load(path)?,
        None => PartialConfig::default(),
    };
    Ok(base.merge(args.into_partial()))
}

/// Layered and validated configuration.
pub fn load(config_file: Option<&Path>, args: ConfigArgs) -> anyhow::Result<WatchConfig> {
    let config = layered(config_file, args)?
        .finish()
        .context("configuration rejected")?;
    Ok(config)
}
