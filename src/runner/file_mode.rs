//! Runs the tail pipeline against a log directory.

use crate::checkpoint::{CheckpointDB, StreamPosition};
use crate::config::Config;
use crate::error::TailError;
use crate::processor::RecordProcessor;
use crate::rotation::RotationPattern;
use crate::runner::build_processor;
use crate::sequencer::RotationSequencer;
use crate::tailer::{Tailer, TailerConfig};
use crate::watcher::DirectoryWatcher;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the agent until a shutdown signal or a fatal error.
pub async fn run(config: &Config, cancel_token: CancellationToken) -> Result<()> {
    info!("pglog-agent starting");

    let pattern = config.rotation_pattern()?;
    let checkpoint_db = Arc::new(CheckpointDB::open(config.checkpoint_db_path())?);
    let position = checkpoint_db
        .read()
        .await
        .context("could not fetch initial log stream position")?;
    let processor = build_processor(&config.processor)?;

    let signal_handle = tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("shutdown signal received"),
                        Err(err) => {
                            error!(error = %err, "failed while waiting for shutdown signal");
                            return;
                        }
                    }
                    cancel_token.cancel();
                }
            }
        }
    });

    let result = run_pipeline(
        config.tailer_config(),
        pattern,
        checkpoint_db,
        processor,
        position,
        cancel_token,
    )
    .await;
    signal_handle.abort();

    let position = result?;
    info!(
        filename = %position.filename,
        offset = position.offset,
        bytes_read_total = position.bytes_read_total,
        "pglog-agent stopped"
    );
    Ok(())
}

/// Installs the watch, resolves the starting file, and runs the sequencer and
/// tail loop until either stops. The tail loop's result wins; a sequencer
/// that stops first is an error.
pub async fn run_pipeline<P: RecordProcessor>(
    tailer_config: TailerConfig,
    pattern: RotationPattern,
    checkpoint_db: Arc<CheckpointDB>,
    processor: P,
    mut position: StreamPosition,
    cancel_token: CancellationToken,
) -> Result<StreamPosition, TailError> {
    let mut watcher = DirectoryWatcher::install(&tailer_config.log_dir, pattern.clone())?;
    let mut backlog = watcher.initial_scan(&position.filename)?;

    if position.filename.is_empty() {
        if backlog.is_empty() {
            return Err(TailError::NoLogFiles {
                dir: tailer_config.log_dir.clone(),
                pattern: pattern.glob().to_string(),
            });
        }
        position.switch_to(backlog.remove(0));
        info!(filename = %position.filename, "checkpoint names no file; starting from the oldest");
    }

    let (handoff_tx, handoff_rx) = mpsc::channel(1);
    let sequencer = RotationSequencer::new(position.filename.clone(), backlog);
    let mut sequencer_handle = tokio::spawn(sequencer.run(watcher, handoff_tx));

    let tailer = Tailer::new(
        tailer_config,
        checkpoint_db,
        processor,
        position,
        handoff_rx,
        cancel_token,
    );

    let result = tokio::select! {
        result = tailer.run() => result,
        joined = &mut sequencer_handle => match joined {
            Ok(Ok(())) => Err(TailError::SequencerStopped),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(TailError::SequencerTask(err.to_string())),
        },
    };
    sequencer_handle.abort();
    result
}
