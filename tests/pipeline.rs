use pglog_agent::checkpoint::{CheckpointDB, StreamPosition};
use pglog_agent::error::TailError;
use pglog_agent::processor::RecordProcessor;
use pglog_agent::reader::ReaderOptions;
use pglog_agent::rotation::{RotationPattern, DEFAULT_FILENAME_TEMPLATE};
use pglog_agent::runner::file_mode::run_pipeline;
use pglog_agent::tailer::TailerConfig;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const FIRST: &str = "postgresql-2024-01-01_000000.csv";
const SECOND: &str = "postgresql-2024-01-01_010000.csv";
const THIRD: &str = "postgresql-2024-01-01_020000.csv";

type Seen = Arc<Mutex<Vec<(String, u64, String)>>>;

struct Recorder {
    seen: Seen,
    stop_after: usize,
    cancel_token: CancellationToken,
}

impl RecordProcessor for Recorder {
    fn process(&mut self, position: &StreamPosition, record: &[String]) -> anyhow::Result<()> {
        let mut seen = self.seen.lock().unwrap();
        seen.push((position.filename.clone(), position.offset, record[0].clone()));
        if seen.len() == self.stop_after {
            self.cancel_token.cancel();
        }
        Ok(())
    }
}

fn tailer_config(log_dir: &Path) -> TailerConfig {
    TailerConfig {
        log_dir: log_dir.to_path_buf(),
        poll_interval: Duration::from_millis(20),
        persist_interval_bytes: 32 * 1024 * 1024,
        min_fields: 2,
        reader: ReaderOptions {
            lazy_quotes: true,
            ..ReaderOptions::default()
        },
    }
}

async fn checkpoint_at(dir: &Path, filename: &str) -> Arc<CheckpointDB> {
    let db = Arc::new(CheckpointDB::open(dir.join("state/checkpoint.db")).unwrap());
    db.initialize(&StreamPosition::new(filename, 0)).await.unwrap();
    db
}

fn summary(seen: &Seen) -> Vec<(String, u64, String)> {
    seen.lock().unwrap().clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follows_a_rotation_created_while_tailing() {
    let logs = tempdir().unwrap();
    let state = tempdir().unwrap();
    std::fs::write(logs.path().join(FIRST), "one,a\ntwo,\"b\nc\"\n").unwrap();

    let db = checkpoint_at(state.path(), FIRST).await;
    let cancel_token = CancellationToken::new();
    let seen: Seen = Arc::default();
    let recorder = Recorder {
        seen: seen.clone(),
        stop_after: 4,
        cancel_token: cancel_token.clone(),
    };

    let handle = tokio::spawn(run_pipeline(
        tailer_config(logs.path()),
        RotationPattern::from_template(DEFAULT_FILENAME_TEMPLATE).unwrap(),
        db.clone(),
        recorder,
        db.read().await.unwrap(),
        cancel_token,
    ));

    sleep(Duration::from_millis(300)).await;
    std::fs::write(logs.path().join(SECOND), "three,d\nfour,e\n").unwrap();

    let position = timeout(Duration::from_secs(10), handle)
        .await
        .expect("pipeline finished")
        .unwrap()
        .unwrap();

    assert_eq!(
        summary(&seen),
        vec![
            (FIRST.to_string(), 0, "one".to_string()),
            (FIRST.to_string(), 6, "two".to_string()),
            (SECOND.to_string(), 0, "three".to_string()),
            (SECOND.to_string(), 8, "four".to_string()),
        ]
    );
    assert_eq!(position.filename, SECOND);
    assert_eq!(position.offset, 15);
    assert_eq!(position.bytes_read_total, 31);
    assert_eq!(db.read().await.unwrap(), position);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_checkpoint_starts_from_the_oldest_file() {
    let logs = tempdir().unwrap();
    let state = tempdir().unwrap();
    std::fs::write(logs.path().join(THIRD), "z,3\n").unwrap();
    std::fs::write(logs.path().join(FIRST), "x,1\n").unwrap();
    std::fs::write(logs.path().join(SECOND), "y,2\n").unwrap();
    std::fs::write(logs.path().join("postgresql.conf"), "not,a,log\n").unwrap();

    let db = checkpoint_at(state.path(), "").await;
    let cancel_token = CancellationToken::new();
    let seen: Seen = Arc::default();
    let recorder = Recorder {
        seen: seen.clone(),
        stop_after: 3,
        cancel_token: cancel_token.clone(),
    };

    let position = timeout(
        Duration::from_secs(10),
        run_pipeline(
            tailer_config(logs.path()),
            RotationPattern::from_template(DEFAULT_FILENAME_TEMPLATE).unwrap(),
            db.clone(),
            recorder,
            db.read().await.unwrap(),
            cancel_token,
        ),
    )
    .await
    .expect("pipeline finished")
    .unwrap();

    let order: Vec<String> = summary(&seen).into_iter().map(|(_, _, first)| first).collect();
    assert_eq!(order, vec!["x", "y", "z"]);
    assert_eq!(position, StreamPosition {
        filename: THIRD.to_string(),
        offset: 4,
        bytes_read_total: 12,
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumes_after_files_older_than_the_checkpoint() {
    let logs = tempdir().unwrap();
    let state = tempdir().unwrap();
    std::fs::write(logs.path().join(FIRST), "old,1\n").unwrap();
    std::fs::write(logs.path().join(SECOND), "cur,2\nnext,3\n").unwrap();

    let db = Arc::new(CheckpointDB::open(state.path().join("checkpoint.db")).unwrap());
    db.initialize(&StreamPosition::new(SECOND, 6)).await.unwrap();

    let cancel_token = CancellationToken::new();
    let seen: Seen = Arc::default();
    let recorder = Recorder {
        seen: seen.clone(),
        stop_after: 1,
        cancel_token: cancel_token.clone(),
    };

    timeout(
        Duration::from_secs(10),
        run_pipeline(
            tailer_config(logs.path()),
            RotationPattern::from_template(DEFAULT_FILENAME_TEMPLATE).unwrap(),
            db.clone(),
            recorder,
            db.read().await.unwrap(),
            cancel_token,
        ),
    )
    .await
    .expect("pipeline finished")
    .unwrap();

    assert_eq!(summary(&seen), vec![(SECOND.to_string(), 6, "next".to_string())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_creation_is_fatal() {
    let logs = tempdir().unwrap();
    let state = tempdir().unwrap();
    std::fs::write(logs.path().join(SECOND), "cur,2\n").unwrap();

    let db = checkpoint_at(state.path(), SECOND).await;
    let recorder = Recorder {
        seen: Arc::default(),
        stop_after: usize::MAX,
        cancel_token: CancellationToken::new(),
    };

    let handle = tokio::spawn(run_pipeline(
        tailer_config(logs.path()),
        RotationPattern::from_template(DEFAULT_FILENAME_TEMPLATE).unwrap(),
        db.clone(),
        recorder,
        db.read().await.unwrap(),
        CancellationToken::new(),
    ));

    sleep(Duration::from_millis(300)).await;
    std::fs::write(logs.path().join(FIRST), "late,1\n").unwrap();

    let err = timeout(Duration::from_secs(10), handle)
        .await
        .expect("pipeline finished")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TailError::OutOfOrder { .. }), "{err}");
    assert_eq!(db.read().await.unwrap().offset, 0);
}

#[tokio::test]
async fn empty_checkpoint_with_no_logs_is_fatal() {
    let logs = tempdir().unwrap();
    let state = tempdir().unwrap();
    let db = checkpoint_at(state.path(), "").await;

    let err = run_pipeline(
        tailer_config(logs.path()),
        RotationPattern::from_template(DEFAULT_FILENAME_TEMPLATE).unwrap(),
        db.clone(),
        Recorder {
            seen: Arc::default(),
            stop_after: usize::MAX,
            cancel_token: CancellationToken::new(),
        },
        db.read().await.unwrap(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TailError::NoLogFiles { .. }));
}
