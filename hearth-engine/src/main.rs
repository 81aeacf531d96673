use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hearth_engine::config::{CliArgs, ServiceConfig};

fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ServiceConfig::try_from(args).map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hearth-io")
        .build()?;
    let result = runtime.block_on(hearth_engine::service::run(config));

    // A model load still in progress on a blocking thread must not hold the
    // process open.
    runtime.shutdown_timeout(Duration::from_secs(5));

    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "hearth-engine exited with error");
    }
    result
}
