//! Orders discovered files and offers them to the tail loop one at a time.

use crate::error::TailError;
use crate::watcher::DirectoryWatcher;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct RotationSequencer {
    current: String,
    pending: VecDeque<String>,
}

impl RotationSequencer {
    /// `backlog` must already be sorted and strictly after `current`, as
    /// returned by [`DirectoryWatcher::initial_scan`].
    pub fn new(current: impl Into<String>, backlog: Vec<String>) -> Self {
        Self {
            current: current.into(),
            pending: backlog.into(),
        }
    }

    /// Queues a newly created file. It must sort after everything already
    /// current or queued; anything else means rotation order is broken.
    pub fn enqueue(&mut self, filename: String) -> Result<(), TailError> {
        if filename <= self.current {
            return Err(TailError::OutOfOrder {
                filename,
                current: self.current.clone(),
            });
        }
        if let Some(queued) = self.pending.iter().find(|queued| filename <= **queued) {
            return Err(TailError::OutOfOrderQueued {
                queued: queued.clone(),
                filename,
            });
        }
        debug!(filename = %filename, pending = self.pending.len() + 1, "queued new log file");
        self.pending.push_back(filename);
        Ok(())
    }

    /// Pops the head of the queue and records it as current.
    pub fn take_next(&mut self) -> Option<String> {
        let next = self.pending.pop_front()?;
        self.current = next.clone();
        Some(next)
    }

    /// Feeds watcher events into the queue and the queue into `handoff`.
    ///
    /// Returns `Ok(())` once the tail loop drops its end of the handoff.
    pub async fn run(
        mut self,
        mut watcher: DirectoryWatcher,
        handoff: mpsc::Sender<String>,
    ) -> Result<(), TailError> {
        loop {
            let has_pending = !self.pending.is_empty();
            tokio::select! {
                permit = handoff.reserve(), if has_pending => {
                    let Ok(permit) = permit else {
                        debug!("tail loop closed the handoff; stopping sequencer");
                        return Ok(());
                    };
                    if let Some(next) = self.take_next() {
                        info!(
                            filename = %next,
                            pending = self.pending.len(),
                            "offering next log file to the tail loop"
                        );
                        permit.send(next);
                    }
                }
                event = watcher.next_event() => {
                    self.enqueue(event?)?;
                }
            }
        }
    }
}
