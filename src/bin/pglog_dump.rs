//! Prints the raw contents of the checkpoint database as JSON.

use anyhow::{Context, Result};
use pglog_agent::checkpoint::CheckpointDB;
use pglog_agent::config::Config;
use pglog_agent::{config_path, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    let checkpoint_db = CheckpointDB::open(config.checkpoint_db_path())?;
    let contents = checkpoint_db.dump().await?;
    let rendered =
        serde_json::to_string_pretty(&contents).context("failed to encode checkpoint contents")?;
    println!("{rendered}");
    Ok(())
}
