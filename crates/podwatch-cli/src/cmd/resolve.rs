use super::ConfigArgs;
use crate::output::print_json;
use anyhow::{anyhow, Context};
use podwatch_core::paths::parse_date_stamp;
use podwatch_core::resolver::PathResolver;
use podwatch_core::types::InputType;
use std::path::Path;

/// Resolve without running anything. Only `path`, `date` and `input_type`
/// matter here, so the rest of the configuration is not validated.
pub fn run(config_file: Option<&Path>, args: ConfigArgs, json: bool) -> anyhow::Result<()> {
    let partial = super::layered(config_file, args)?;
    let root = partial.path.ok_or_else(|| anyhow!("--path is required"))?;
    let stamp = partial.date.ok_or_else(|| anyhow!("--date is required"))?;
    let date = parse_date_stamp(&stamp)?;
    let input_type = partial.input_type.unwrap_or(InputType::Pod5);

    let resolution = PathResolver::new(input_type)
        .resolve(&root, date)
        .with_context(|| format!("cannot resolve {stamp} under {}", root.display()))?;

    if json {
        return print_json(&resolution);
    }

    println!("{}", resolution.experiment_dir.display());
    println!("  raw data:   {}", resolution.raw_dir.display());
    println!("  device:     {}", resolution.device_id);
    println!("  flow cell:  {}", resolution.flow_cell_id);
    println!("  experiment: {}", resolution.experiment_id);
    for alt in &resolution.discarded {
        println!("  discarded:  {}", alt.display());
    }
    Ok(())
}
