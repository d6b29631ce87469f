mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, ConfigArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "podwatch",
    about = "Watch a sequencing output tree and basecall each run as soon as it finishes",
    version,
    propagate_version = true
)]
struct Cli {
    /// YAML configuration file; command-line flags override its values
    #[arg(long, short = 'c', global = true, env = "PODWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process finished runs already on disk, then watch for new ones
    Watch {
        #[command(flatten)]
        args: ConfigArgs,
    },

    /// Show which experiment directory a date resolves to
    Resolve {
        #[command(flatten)]
        args: ConfigArgs,
    },

    /// List processed markers from the durable index
    Status {
        /// Index file (default: <path>/.podwatch/markers.redb)
        #[arg(long)]
        index: Option<PathBuf>,

        /// Watched root directory
        #[arg(long, env = "PODWATCH_PATH")]
        path: Option<PathBuf>,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Watch { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config_file = cli.config.as_deref();

    let result = match cli.command {
        Commands::Watch { args } => cmd::watch::run(config_file, args, cli.json),
        Commands::Resolve { args } => cmd::resolve::run(config_file, args, cli.json),
        Commands::Status { index, path } => {
            cmd::status::run(config_file, index.as_deref(), path.as_deref(), cli.json)
        }
        Commands::Config { subcommand } => cmd::config::run(config_file, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
