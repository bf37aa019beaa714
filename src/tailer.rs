//! The tail loop: reads the current log file record by record, hands each
//! record to the processor, and moves on to the next file only after the
//! current one has been drained following a rotation.

use crate::checkpoint::{CheckpointDB, StreamPosition};
use crate::error::TailError;
use crate::metrics::{FILE_SWITCHES_TOTAL, READ_BYTES_TOTAL, RECORDS_PROCESSED_TOTAL};
use crate::processor::RecordProcessor;
use crate::reader::{ReaderOptions, RecordReader};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_READ_CHUNK_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub log_dir: PathBuf,
    pub poll_interval: Duration,
    /// Persist once at least this many bytes were consumed since the last persist.
    pub persist_interval_bytes: u64,
    pub min_fields: usize,
    pub reader: ReaderOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailState {
    ReadingCurrentFile,
    AwaitingRotationOrTimeout,
    SwitchingFile,
}

enum FileOutcome {
    Switched,
    Cancelled,
}

pub struct Tailer<P> {
    config: TailerConfig,
    checkpoint_db: Arc<CheckpointDB>,
    processor: P,
    handoff: mpsc::Receiver<String>,
    cancel_token: CancellationToken,
    position: StreamPosition,
    next_filename: Option<String>,
    bytes_since_persist: u64,
    chunk: Vec<u8>,
}

impl<P: RecordProcessor> Tailer<P> {
    pub fn new(
        mut config: TailerConfig,
        checkpoint_db: Arc<CheckpointDB>,
        processor: P,
        position: StreamPosition,
        handoff: mpsc::Receiver<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        // A record is only complete once its newline has been written.
        config.reader.require_trailing_newline = true;
        Self {
            config,
            checkpoint_db,
            processor,
            handoff,
            cancel_token,
            position,
            next_filename: None,
            bytes_since_persist: 0,
            chunk: Vec::new(),
        }
    }

    /// Tails until cancelled or a fatal error. On cancellation the position is
    /// persisted and returned.
    pub async fn run(mut self) -> Result<StreamPosition, TailError> {
        info!(
            filename = %self.position.filename,
            offset = self.position.offset,
            "starting to tail log stream"
        );

        loop {
            let path = self.config.log_dir.join(&self.position.filename);
            let mut file = File::open(&path).await.map_err(|source| TailError::Open {
                path: path.clone(),
                source,
            })?;

            let outcome = self.drain_file(&mut file, &path).await?;
            self.persist().await?;
            if let FileOutcome::Cancelled = outcome {
                info!(
                    filename = %self.position.filename,
                    offset = self.position.offset,
                    bytes_read_total = self.position.bytes_read_total,
                    "tail stopped; position persisted"
                );
                return Ok(self.position);
            }
        }
    }

    async fn drain_file(&mut self, file: &mut File, path: &Path) -> Result<FileOutcome, TailError> {
        let mut read_limit = MAX_READ_CHUNK_BYTES;
        let mut state = TailState::ReadingCurrentFile;

        loop {
            state = match state {
                TailState::ReadingCurrentFile => {
                    if self.cancel_token.is_cancelled() {
                        return Ok(FileOutcome::Cancelled);
                    }

                    let mut chunk = std::mem::take(&mut self.chunk);
                    let read = read_chunk(file, path, self.position.offset, read_limit, &mut chunk).await;
                    let result = match read {
                        Ok(()) => self.dispatch_chunk(&chunk).await,
                        Err(err) => Err(err),
                    };
                    let chunk_len = chunk.len();
                    self.chunk = chunk;
                    let consumed = result?;
                    if self.cancel_token.is_cancelled() {
                        return Ok(FileOutcome::Cancelled);
                    }

                    if chunk_len == 0 {
                        check_not_truncated(file, path, self.position.offset).await?;
                    }

                    if chunk_len == read_limit {
                        if consumed == 0 {
                            read_limit = read_limit.saturating_mul(2);
                            warn!(
                                path = %path.display(),
                                offset = self.position.offset,
                                read_limit,
                                "record larger than read chunk; growing chunk size"
                            );
                        } else {
                            read_limit = MAX_READ_CHUNK_BYTES;
                        }
                        TailState::ReadingCurrentFile
                    } else if self.next_filename.is_some() {
                        // The old file is done only once a read delivers nothing new.
                        if consumed > 0 {
                            TailState::ReadingCurrentFile
                        } else {
                            if chunk_len > 0 {
                                warn!(
                                    path = %path.display(),
                                    offset = self.position.offset,
                                    withheld_bytes = chunk_len,
                                    "leaving incomplete trailing record behind after rotation"
                                );
                            }
                            TailState::SwitchingFile
                        }
                    } else {
                        TailState::AwaitingRotationOrTimeout
                    }
                }
                TailState::AwaitingRotationOrTimeout => {
                    tokio::select! {
                        biased;
                        _ = self.cancel_token.cancelled() => return Ok(FileOutcome::Cancelled),
                        next = self.handoff.recv() => {
                            let next = next.ok_or(TailError::HandoffClosed)?;
                            info!(
                                current = %self.position.filename,
                                next = %next,
                                "rotation detected; switching once the current file is drained"
                            );
                            self.next_filename = Some(next);
                        }
                        _ = sleep(self.config.poll_interval) => {}
                    }
                    TailState::ReadingCurrentFile
                }
                TailState::SwitchingFile => {
                    if let Some(next) = self.next_filename.take() {
                        info!(
                            from = %self.position.filename,
                            to = %next,
                            offset = self.position.offset,
                            "switching to next log file"
                        );
                        self.position.switch_to(next);
                        FILE_SWITCHES_TOTAL.inc();
                    }
                    return Ok(FileOutcome::Switched);
                }
            };
        }
    }

    /// Delivers every complete record in `chunk` and returns the bytes consumed.
    async fn dispatch_chunk(&mut self, chunk: &[u8]) -> Result<u64, TailError> {
        let mut reader = RecordReader::with_options(chunk, self.config.reader.clone());
        let mut consumed = 0u64;

        while !self.cancel_token.is_cancelled() {
            let record = reader.read().map_err(|source| TailError::Parse {
                filename: self.position.filename.clone(),
                offset: self.position.offset,
                source,
            })?;
            let Some(record) = record else {
                break;
            };

            if record.fields.len() < self.config.min_fields {
                return Err(TailError::RecordTooShort {
                    filename: self.position.filename.clone(),
                    offset: self.position.offset,
                    found: record.fields.len(),
                    minimum: self.config.min_fields,
                });
            }

            self.processor
                .process(&self.position, &record.fields)
                .map_err(|cause| TailError::Processor {
                    filename: self.position.filename.clone(),
                    offset: self.position.offset,
                    cause,
                })?;

            self.position.advance(record.bytes_consumed);
            self.bytes_since_persist += record.bytes_consumed;
            consumed += record.bytes_consumed;
            READ_BYTES_TOTAL.inc_by(record.bytes_consumed);
            RECORDS_PROCESSED_TOTAL.inc();

            if self.bytes_since_persist >= self.config.persist_interval_bytes {
                self.persist().await?;
            }
        }

        Ok(consumed)
    }

    async fn persist(&mut self) -> Result<(), TailError> {
        self.checkpoint_db.persist(&self.position).await?;
        debug!(
            filename = %self.position.filename,
            offset = self.position.offset,
            bytes_read_total = self.position.bytes_read_total,
            "checkpoint persisted"
        );
        self.bytes_since_persist = 0;
        Ok(())
    }
}

async fn read_chunk(
    file: &mut File,
    path: &Path,
    offset: u64,
    max_bytes: usize,
    buffer: &mut Vec<u8>,
) -> Result<(), TailError> {
    let read_error = |source| TailError::Read {
        path: path.to_path_buf(),
        offset,
        source,
    };

    buffer.clear();
    file.seek(SeekFrom::Start(offset)).await.map_err(read_error)?;
    (&mut *file)
        .take(max_bytes as u64)
        .read_to_end(buffer)
        .await
        .map_err(read_error)?;
    Ok(())
}

async fn check_not_truncated(file: &File, path: &Path, offset: u64) -> Result<(), TailError> {
    let len = file
        .metadata()
        .await
        .map_err(|source| TailError::Read {
            path: path.to_path_buf(),
            offset,
            source,
        })?
        .len();
    if len < offset {
        return Err(TailError::Truncated {
            path: path.to_path_buf(),
            offset,
            len,
        });
    }
    Ok(())
}
