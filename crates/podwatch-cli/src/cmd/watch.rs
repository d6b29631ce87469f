use super::ConfigArgs;
use crate::output::print_json;
use anyhow::Context;
use podwatch_core::pipeline::WatchOrchestrator;
use std::path::Path;

pub fn run(config_file: Option<&Path>, args: ConfigArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load(config_file, args)?;
    let request = &config.request;
    tracing::info!(
        root = %request.root.display(),
        date = %request.date_stamp(),
        method = %request.basecalling.method(),
        model = %request.basecalling.model(),
        kit = %request.kit,
        "starting podwatch"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async move {
        let orchestrator =
            WatchOrchestrator::from_config(config).context("failed to open the marker index")?;
        orchestrator
            .run(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => tracing::info!("received Ctrl-C, shutting down"),
                    Err(e) => {
                        tracing::error!("cannot listen for Ctrl-C: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await
            .context("watch failed")
    })?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "processed {} marker(s): {} succeeded, {} failed",
            summary.processed, summary.succeeded, summary.failed
        );
    }
    Ok(())
}
