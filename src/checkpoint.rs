use crate::metrics::CHECKPOINT_DURATION;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{self, JoinError};

const KEY_FILENAME: &str = "filename";
const KEY_OFFSET: &str = "offset";
const KEY_BYTES_READ_TOTAL: &str = "bytes_read_total";

/// Where the tail stands: `offset` bytes into `filename`, which is always a
/// record boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPosition {
    pub filename: String,
    pub offset: u64,
    pub bytes_read_total: u64,
}

impl StreamPosition {
    pub fn new(filename: impl Into<String>, offset: u64) -> Self {
        Self {
            filename: filename.into(),
            offset,
            bytes_read_total: 0,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.offset += bytes;
        self.bytes_read_total += bytes;
    }

    pub fn switch_to(&mut self, filename: String) {
        self.filename = filename;
        self.offset = 0;
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint database {} is not initialized; run pglog-init first", .path.display())]
    NotInitialized { path: PathBuf },
    #[error("checkpoint database {} is already initialized", .path.display())]
    AlreadyInitialized { path: PathBuf },
    #[error("checkpoint database {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint database {}: {source}", .path.display())]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create checkpoint directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct CheckpointDB {
    path: Arc<PathBuf>,
}

impl CheckpointDB {
    /// Opens (creating if needed) the database file and its table. The stored
    /// position is left untouched.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CheckpointError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = open_connection(&path)?;
        initialize_schema(&conn, &path)?;

        Ok(Self {
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores the first position. Refuses to overwrite an existing one.
    pub async fn initialize(&self, position: &StreamPosition) -> Result<(), CheckpointError> {
        let db_path = self.path.clone();
        let position = position.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction().map_err(sqlite(&db_path))?;
            let existing: i64 = tx
                .query_row("SELECT COUNT(*) FROM checkpoint", [], |row| row.get(0))
                .map_err(sqlite(&db_path))?;
            if existing > 0 {
                return Err(CheckpointError::AlreadyInitialized {
                    path: db_path.to_path_buf(),
                });
            }
            for (key, value) in entries(&position) {
                tx.execute(
                    "INSERT INTO checkpoint (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
                .map_err(sqlite(&db_path))?;
            }
            tx.commit().map_err(sqlite(&db_path))
        })
        .await?
    }

    pub async fn read(&self) -> Result<StreamPosition, CheckpointError> {
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let _timer = CHECKPOINT_DURATION.with_label_values(&["read"]).start_timer();
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction().map_err(sqlite(&db_path))?;
            let values = load_values(&tx, &db_path)?;
            position_from_values(&db_path, &values)
        })
        .await?
    }

    /// Overwrites all three keys in one transaction.
    pub async fn persist(&self, position: &StreamPosition) -> Result<(), CheckpointError> {
        let db_path = self.path.clone();
        let position = position.clone();
        task::spawn_blocking(move || {
            let _timer = CHECKPOINT_DURATION
                .with_label_values(&["persist"])
                .start_timer();
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction().map_err(sqlite(&db_path))?;
            for (key, value) in entries(&position) {
                let updated = tx
                    .execute(
                        "UPDATE checkpoint SET value = ?2 WHERE key = ?1",
                        params![key, value],
                    )
                    .map_err(sqlite(&db_path))?;
                if updated != 1 {
                    return Err(CheckpointError::NotInitialized {
                        path: db_path.to_path_buf(),
                    });
                }
            }
            tx.commit().map_err(sqlite(&db_path))
        })
        .await?
    }

    /// Raw key/value contents, for inspection tooling.
    pub async fn dump(&self) -> Result<BTreeMap<String, String>, CheckpointError> {
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction().map_err(sqlite(&db_path))?;
            let values = load_values(&tx, &db_path)?;
            Ok::<_, CheckpointError>(values.into_iter().collect::<BTreeMap<_, _>>())
        })
        .await?
    }
}

fn entries(position: &StreamPosition) -> [(&'static str, String); 3] {
    [
        (KEY_FILENAME, position.filename.clone()),
        (KEY_OFFSET, position.offset.to_string()),
        (KEY_BYTES_READ_TOTAL, position.bytes_read_total.to_string()),
    ]
}

fn load_values(tx: &Transaction<'_>, db_path: &Path) -> Result<HashMap<String, String>, CheckpointError> {
    let mut stmt = tx
        .prepare("SELECT key, value FROM checkpoint")
        .map_err(sqlite(db_path))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(sqlite(db_path))?;
    let mut values = HashMap::new();
    for row in rows {
        let (key, value) = row.map_err(sqlite(db_path))?;
        values.insert(key, value);
    }
    Ok(values)
}

fn position_from_values(
    db_path: &Path,
    values: &HashMap<String, String>,
) -> Result<StreamPosition, CheckpointError> {
    let filename = values.get(KEY_FILENAME);
    let offset = values.get(KEY_OFFSET);
    let bytes_read_total = values.get(KEY_BYTES_READ_TOTAL);

    let (filename, offset, bytes_read_total) = match (filename, offset, bytes_read_total) {
        (None, None, None) => {
            return Err(CheckpointError::NotInitialized {
                path: db_path.to_path_buf(),
            })
        }
        (Some(filename), Some(offset), Some(total)) => (filename, offset, total),
        _ => {
            let missing: Vec<&str> = [KEY_FILENAME, KEY_OFFSET, KEY_BYTES_READ_TOTAL]
                .into_iter()
                .filter(|key| !values.contains_key(*key))
                .collect();
            return Err(CheckpointError::Corrupt {
                path: db_path.to_path_buf(),
                reason: format!("missing keys: {}", missing.join(", ")),
            });
        }
    };

    Ok(StreamPosition {
        filename: filename.clone(),
        offset: parse_counter(db_path, KEY_OFFSET, offset)?,
        bytes_read_total: parse_counter(db_path, KEY_BYTES_READ_TOTAL, bytes_read_total)?,
    })
}

fn parse_counter(db_path: &Path, key: &str, raw: &str) -> Result<u64, CheckpointError> {
    raw.parse().map_err(|_| CheckpointError::Corrupt {
        path: db_path.to_path_buf(),
        reason: format!("{key} is not an unsigned integer: {raw:?}"),
    })
}

fn sqlite(path: &Path) -> impl Fn(rusqlite::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Sqlite {
        path: path.to_path_buf(),
        source,
    }
}

fn open_connection(path: &Path) -> Result<Connection, CheckpointError> {
    let conn = Connection::open(path).map_err(sqlite(path))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(sqlite(path))?;
    // A committed position must survive power loss, not just a crash.
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(sqlite(path))?;

    Ok(conn)
}

fn initialize_schema(conn: &Connection, path: &Path) -> Result<(), CheckpointError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoint (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
    .map_err(sqlite(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reading_before_initialize_fails() {
        let dir = tempdir().unwrap();
        let db = CheckpointDB::open(dir.path().join("checkpoint.db")).unwrap();
        assert!(matches!(
            db.read().await,
            Err(CheckpointError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn initialize_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let db = CheckpointDB::open(dir.path().join("state/checkpoint.db")).unwrap();
        let position = StreamPosition::new("postgresql-2024-01-01_000000.csv", 128);

        db.initialize(&position).await.unwrap();
        assert_eq!(db.read().await.unwrap(), position);

        let err = db.initialize(&position).await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyInitialized { .. }));
    }

    #[tokio::test]
    async fn persist_overwrites_position_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        let db = CheckpointDB::open(&path).unwrap();
        db.initialize(&StreamPosition::new("a.csv", 0)).await.unwrap();

        let mut position = StreamPosition::new("a.csv", 0);
        position.advance(40);
        position.switch_to("b.csv".to_string());
        position.advance(2);
        db.persist(&position).await.unwrap();

        let reopened = CheckpointDB::open(&path).unwrap();
        let stored = reopened.read().await.unwrap();
        assert_eq!(stored.filename, "b.csv");
        assert_eq!(stored.offset, 2);
        assert_eq!(stored.bytes_read_total, 42);
    }

    #[tokio::test]
    async fn persist_requires_initialized_database() {
        let dir = tempdir().unwrap();
        let db = CheckpointDB::open(dir.path().join("checkpoint.db")).unwrap();
        let err = db.persist(&StreamPosition::new("a.csv", 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotInitialized { .. }));
        assert!(db.dump().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_or_malformed_keys_are_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        let db = CheckpointDB::open(&path).unwrap();
        db.initialize(&StreamPosition::new("a.csv", 5)).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE checkpoint SET value = 'x' WHERE key = 'offset'", [])
            .unwrap();
        assert!(matches!(db.read().await, Err(CheckpointError::Corrupt { .. })));

        conn.execute("DELETE FROM checkpoint WHERE key = 'bytes_read_total'", [])
            .unwrap();
        match db.read().await {
            Err(CheckpointError::Corrupt { reason, .. }) => {
                assert!(reason.contains("bytes_read_total"))
            }
            other => panic!("expected corrupt checkpoint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dump_lists_raw_keys() {
        let dir = tempdir().unwrap();
        let db = CheckpointDB::open(dir.path().join("checkpoint.db")).unwrap();
        db.initialize(&StreamPosition::new("a.csv", 7)).await.unwrap();

        let dump = db.dump().await.unwrap();
        assert_eq!(dump.get("filename").map(String::as_str), Some("a.csv"));
        assert_eq!(dump.get("offset").map(String::as_str), Some("7"));
        assert_eq!(dump.get("bytes_read_total").map(String::as_str), Some("0"));
    }

    #[test]
    fn position_serializes_with_camel_case_total() {
        let json = serde_json::to_string(&StreamPosition::new("a.csv", 3)).unwrap();
        assert_eq!(json, r#"{"filename":"a.csv","offset":3,"bytesReadTotal":0}"#);
    }
}
