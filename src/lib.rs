//! Tails a directory of rotating PostgreSQL csvlog files.
//!
//! Records are read in order across rotations, handed to a
//! [`processor::RecordProcessor`], and the position after the last delivered
//! record is checkpointed in SQLite so a restart resumes where it left off.

pub mod checkpoint;
pub mod config;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod reader;
pub mod rotation;
pub mod runner;
pub mod sequencer;
pub mod tailer;
pub mod watcher;

/// Environment variable naming the TOML config file.
pub const CONFIG_ENV: &str = "PGLOG_AGENT_CONFIG";

pub fn config_path() -> String {
    std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string())
}

pub fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
