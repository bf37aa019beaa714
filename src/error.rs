use crate::checkpoint::CheckpointError;
use crate::reader::ReadError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the directory watch. All of them end the tail.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create file system watcher: {0}")]
    Init(#[source] notify::Error),
    #[error("failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("failed to list {}: {source}", .path.display())]
    Enumerate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file system watcher reported an error: {0}")]
    Notify(#[source] notify::Error),
    #[error("discovery queue full ({capacity} entries); lost creation of {filename}")]
    QueueOverflow { filename: String, capacity: usize },
    #[error("file system watcher dropped events and asked for a rescan")]
    Rescan,
    #[error("discovery event channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("new file {filename:?} does not sort after the current file {current:?}")]
    OutOfOrder { filename: String, current: String },
    #[error("new file {filename:?} does not sort after the queued file {queued:?}")]
    OutOfOrderQueued { filename: String, queued: String },
    #[error("no log files matching {pattern} in {}", .dir.display())]
    NoLogFiles { dir: PathBuf, pattern: String },
    #[error("could not open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("could not read {} at offset {offset}: {source}", .path.display())]
    Read {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },
    #[error("{} shrank to {len} bytes, below the checkpointed offset {offset}", .path.display())]
    Truncated { path: PathBuf, offset: u64, len: u64 },
    #[error("malformed record in {filename} at offset {offset}: {source}")]
    Parse {
        filename: String,
        offset: u64,
        source: ReadError,
    },
    #[error("record in {filename} at offset {offset} has {found} fields, expected at least {minimum}")]
    RecordTooShort {
        filename: String,
        offset: u64,
        found: usize,
        minimum: usize,
    },
    #[error("processor failed on record in {filename} at offset {offset}: {cause:#}")]
    Processor {
        filename: String,
        offset: u64,
        cause: anyhow::Error,
    },
    #[error("rotation handoff closed while the tail loop was waiting")]
    HandoffClosed,
    #[error("rotation sequencer stopped unexpectedly")]
    SequencerStopped,
    #[error("rotation sequencer task failed: {0}")]
    SequencerTask(String),
}
