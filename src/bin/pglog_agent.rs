//! pglog-agent: follows rotating PostgreSQL csvlog files and feeds each record
//! to the configured processor.

use anyhow::{Context, Result};
use pglog_agent::config::Config;
use pglog_agent::{config_path, init_tracing, metrics, runner};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    metrics::record_start_time();
    let cancel_token = CancellationToken::new();

    if let Some(addr) = config.metrics_addr()? {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(addr, cancel_token).await {
                error!(error = format!("{err:#}"), "metrics server failed");
            }
        });
    }

    let result = runner::file_mode::run(&config, cancel_token.clone()).await;
    cancel_token.cancel();

    if let Err(err) = &result {
        error!(error = format!("{err:#}"), "fatal error; exiting");
    }
    result
}
