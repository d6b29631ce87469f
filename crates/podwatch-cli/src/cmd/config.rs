use super::ConfigArgs;
use crate::output::print_json;
use clap::Subcommand;
use podwatch_core::config::IndexConfig;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Load and validate the configuration without watching
    Validate {
        #[command(flatten)]
        args: ConfigArgs,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_file: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate { args } => validate(config_file, args, json),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(config_file: Option<&Path>, args: ConfigArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load(config_file, args)?;

    if json {
        return print_json(&config);
    }

    let request = &config.request;
    println!("configuration ok");
    println!("  root:       {}", request.root.display());
    println!("  date:       {}", request.date_stamp());
    println!(
        "  basecall:   {} {} ({})",
        request.basecalling.method(),
        request.basecalling.model(),
        request.input_type
    );
    println!("  kit:        {}", request.kit);
    println!("  recipients: {}", request.recipients.join(", "));
    println!("  tool:       {}", config.tool.binary);
    match &config.index {
        IndexConfig::Durable { path } => println!("  index:      {}", path.display()),
        IndexConfig::InMemory => println!("  index:      in memory"),
    }
    if !config.mail.enabled {
        println!("  mail:       disabled");
    } else {
        println!("  mail:       {}:{}", config.mail.server, config.mail.port);
    }
    Ok(())
}
