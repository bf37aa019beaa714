//! Discovery of newly rotated log files.
//!
//! The watch is installed before the directory is listed, so a file created
//! while the listing runs is seen by at least one of the two. Names that the
//! initial scan already returned are dropped from the live stream.

use crate::error::WatchError;
use crate::rotation::RotationPattern;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

pub const DISCOVERY_QUEUE_CAPACITY: usize = 32;

pub struct DirectoryWatcher {
    log_dir: PathBuf,
    pattern: RotationPattern,
    _watcher: Option<RecommendedWatcher>,
    events: mpsc::Receiver<String>,
    failures: mpsc::UnboundedReceiver<WatchError>,
    scanned: HashSet<String>,
}

impl DirectoryWatcher {
    pub fn install(log_dir: &Path, pattern: RotationPattern) -> Result<Self, WatchError> {
        let (event_tx, events) = mpsc::channel(DISCOVERY_QUEUE_CAPACITY);
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let callback_pattern = pattern.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => handle_event(&callback_pattern, &event_tx, &failure_tx, event),
                Err(err) => {
                    error!(error = %err, "file watcher error");
                    let _ = failure_tx.send(WatchError::Notify(err));
                }
            },
            NotifyConfig::default(),
        )
        .map_err(WatchError::Init)?;

        watcher
            .watch(log_dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: log_dir.to_path_buf(),
                source,
            })?;

        info!(
            path = %log_dir.display(),
            pattern = pattern.glob(),
            "watching log directory for new files"
        );

        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            pattern,
            _watcher: Some(watcher),
            events,
            failures,
            scanned: HashSet::new(),
        })
    }

    /// Lists matching files newer than `checkpoint_filename`, in order.
    ///
    /// Creation events buffered since the watch was installed are folded in,
    /// so every file present at startup is returned exactly once.
    pub fn initial_scan(&mut self, checkpoint_filename: &str) -> Result<Vec<String>, WatchError> {
        let mut files = list_matching(&self.log_dir, &self.pattern)?;
        let listed = files.len();
        while let Ok(filename) = self.events.try_recv() {
            files.push(filename);
        }
        if let Ok(err) = self.failures.try_recv() {
            return Err(err);
        }

        self.scanned.extend(files.iter().cloned());
        let backlog = initial_backlog(files, checkpoint_filename);
        info!(
            path = %self.log_dir.display(),
            listed,
            backlog = backlog.len(),
            "initial directory scan complete"
        );
        Ok(backlog)
    }

    /// Waits for the next newly created matching file.
    pub async fn next_event(&mut self) -> Result<String, WatchError> {
        loop {
            let filename = tokio::select! {
                biased;
                Some(err) = self.failures.recv() => return Err(err),
                event = self.events.recv() => event.ok_or(WatchError::Closed)?,
            };
            if self.scanned.contains(&filename) {
                debug!(filename = %filename, "ignoring creation event already covered by the initial scan");
                continue;
            }
            return Ok(filename);
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(
        events: mpsc::Receiver<String>,
        failures: mpsc::UnboundedReceiver<WatchError>,
    ) -> Self {
        Self {
            log_dir: PathBuf::new(),
            pattern: RotationPattern::from_template(crate::rotation::DEFAULT_FILENAME_TEMPLATE)
                .expect("default template is valid"),
            _watcher: None,
            events,
            failures,
            scanned: HashSet::new(),
        }
    }
}

/// Sorted, deduplicated names strictly after `checkpoint_filename`. An empty
/// checkpoint filename keeps everything.
pub fn initial_backlog(mut files: Vec<String>, checkpoint_filename: &str) -> Vec<String> {
    files.sort();
    files.dedup();
    if !checkpoint_filename.is_empty() {
        files.retain(|name| name.as_str() > checkpoint_filename);
    }
    files
}

fn list_matching(dir: &Path, pattern: &RotationPattern) -> Result<Vec<String>, WatchError> {
    let enumerate_error = |source| WatchError::Enumerate {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(enumerate_error)? {
        let path = entry.map_err(enumerate_error)?.path();
        if path.is_dir() {
            continue;
        }
        if let Some(filename) = pattern.match_path(&path) {
            files.push(filename);
        }
    }
    Ok(files)
}

fn handle_event(
    pattern: &RotationPattern,
    event_tx: &mpsc::Sender<String>,
    failure_tx: &mpsc::UnboundedSender<WatchError>,
    event: Event,
) {
    if event.need_rescan() {
        warn!("file watcher lost events");
        let _ = failure_tx.send(WatchError::Rescan);
        return;
    }
    if !matches!(event.kind, EventKind::Create(_)) {
        return;
    }

    for path in event.paths {
        if path.is_dir() {
            continue;
        }
        let Some(filename) = pattern.match_path(&path) else {
            debug!(path = %path.display(), "ignoring file that does not match the rotation pattern");
            continue;
        };
        debug!(filename = %filename, "detected new log file");
        match event_tx.try_send(filename) {
            Ok(()) => {}
            Err(TrySendError::Full(filename)) => {
                error!(filename = %filename, "discovery queue full; dropping file event");
                let _ = failure_tx.send(WatchError::QueueOverflow {
                    filename,
                    capacity: DISCOVERY_QUEUE_CAPACITY,
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("discovery queue closed; dropping file event");
            }
        }
    }
}
