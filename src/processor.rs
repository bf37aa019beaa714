use crate::checkpoint::StreamPosition;
use crate::entry::LogEntry;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Consumes records in file order. An error stops the tail without
/// checkpointing past the failing record.
pub trait RecordProcessor: Send {
    fn process(&mut self, position: &StreamPosition, record: &[String]) -> Result<()>;
}

impl<T: RecordProcessor + ?Sized> RecordProcessor for Box<T> {
    fn process(&mut self, position: &StreamPosition, record: &[String]) -> Result<()> {
        (**self).process(position, record)
    }
}

/// Writes the `message` column of every record, one per line.
pub struct MessagePrinter<W> {
    out: W,
}

impl<W: Write + Send> MessagePrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RecordProcessor for MessagePrinter<W> {
    fn process(&mut self, _position: &StreamPosition, record: &[String]) -> Result<()> {
        let entry = LogEntry::new(record)?;
        writeln!(self.out, "{}", entry.message()).context("failed to write message")?;
        self.out.flush().context("failed to flush message output")?;
        Ok(())
    }
}

/// Appends one JSON object per record to a file.
pub struct JsonLinesWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonLinesWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }
}

impl RecordProcessor for JsonLinesWriter {
    fn process(&mut self, position: &StreamPosition, record: &[String]) -> Result<()> {
        let entry = LogEntry::new(record)?;
        let columns: Map<String, Value> = entry
            .columns()
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();
        let persisted = PersistedRecord {
            filename: &position.filename,
            offset: position.offset,
            columns,
        };

        serde_json::to_writer(&mut self.out, &persisted)
            .context("failed to encode record for json output")?;
        self.out
            .write_all(b"\n")
            .and_then(|()| self.out.flush())
            .with_context(|| format!("failed to write {}", self.path.display()))?;

        debug!(
            filename = %position.filename,
            offset = position.offset,
            output = %self.path.display(),
            "appended record to json output"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct PersistedRecord<'a> {
    filename: &'a str,
    offset: u64,
    #[serde(flatten)]
    columns: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests::csvlog_record;
    use tempfile::tempdir;

    #[test]
    fn message_printer_writes_message_column() {
        let mut printer = MessagePrinter::new(Vec::new());
        let position = StreamPosition::new("a.csv", 0);
        printer
            .process(&position, &csvlog_record("database system is ready"))
            .unwrap();
        printer.process(&position, &csvlog_record("checkpoint starting")).unwrap();
        assert_eq!(
            String::from_utf8(printer.into_inner()).unwrap(),
            "database system is ready\ncheckpoint starting\n"
        );
    }

    #[test]
    fn short_records_are_rejected() {
        let mut printer = MessagePrinter::new(Vec::new());
        let err = printer
            .process(&StreamPosition::default(), &["a".to_string(), "b".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("unexpected record length of 2"));
    }

    #[test]
    fn json_lines_writer_appends_position_and_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/records.jsonl");

        let mut writer = JsonLinesWriter::open(&path).unwrap();
        writer
            .process(&StreamPosition::new("a.csv", 0), &csvlog_record("first"))
            .unwrap();
        drop(writer);

        let mut writer = JsonLinesWriter::open(&path).unwrap();
        writer
            .process(&StreamPosition::new("a.csv", 120), &csvlog_record("second"))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["filename"], "a.csv");
        assert_eq!(lines[0]["message"], "first");
        assert_eq!(lines[1]["offset"], 120);
        assert_eq!(lines[1]["message"], "second");
        assert_eq!(lines[1]["user_name"], "postgres");
    }
}
