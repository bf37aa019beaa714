//! Seeds the checkpoint database with the file and offset to start tailing from.
//!
//! Usage: `pglog-init FILENAME [OFFSET]`. An empty FILENAME starts at the
//! oldest matching file in the log directory.

use anyhow::{bail, Context, Result};
use pglog_agent::checkpoint::{CheckpointDB, StreamPosition};
use pglog_agent::config::Config;
use pglog_agent::{config_path, init_tracing};
use tracing::info;

const USAGE: &str = "usage: pglog-init FILENAME [OFFSET]";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (filename, offset) = match args.as_slice() {
        [filename] => (filename.clone(), 0),
        [filename, offset] => {
            let offset: u64 = offset
                .parse()
                .with_context(|| format!("invalid OFFSET {offset:?}\n{USAGE}"))?;
            (filename.clone(), offset)
        }
        _ => bail!(USAGE),
    };

    let config_path = config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    if filename.is_empty() {
        if offset != 0 {
            bail!("OFFSET must be 0 when FILENAME is empty");
        }
    } else {
        let pattern = config.rotation_pattern()?;
        if !pattern.matches(&filename) {
            bail!(
                "{filename:?} does not match the filename template {:?}",
                pattern.template()
            );
        }
        let path = config.log_dir().join(&filename);
        let len = std::fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if offset > len {
            bail!("OFFSET {offset} is past the end of {} ({len} bytes)", path.display());
        }
    }

    let checkpoint_db = CheckpointDB::open(config.checkpoint_db_path())?;
    let position = StreamPosition::new(filename, offset);
    checkpoint_db.initialize(&position).await?;

    info!(
        db = %checkpoint_db.path().display(),
        filename = %position.filename,
        offset = position.offset,
        "checkpoint initialized"
    );
    Ok(())
}
