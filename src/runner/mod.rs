//! Wiring for the agent: processor selection and the tail pipeline.

pub mod file_mode;

use crate::config::{ProcessorConfig, ProcessorKind};
use crate::processor::{JsonLinesWriter, MessagePrinter, RecordProcessor};
use anyhow::{Context, Result};
use tracing::info;

/// Build the record processor selected in configuration.
pub fn build_processor(config: &ProcessorConfig) -> Result<Box<dyn RecordProcessor>> {
    match config.kind {
        ProcessorKind::Stdout => {
            info!("printing csvlog messages to stdout");
            Ok(Box::new(MessagePrinter::new(std::io::stdout())))
        }
        ProcessorKind::Jsonl => {
            let output_path = config
                .output_path()
                .context("processor kind \"jsonl\" requires processor.output_path")?;
            let writer = JsonLinesWriter::open(&output_path)?;
            info!(output = %output_path.display(), "appending records as json lines");
            Ok(Box::new(writer))
        }
    }
}
