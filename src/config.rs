use crate::entry::MIN_CSVLOG_FIELDS;
use crate::reader::{FieldsPerRecord, ReaderOptions};
use crate::rotation::{RotationPattern, DEFAULT_FILENAME_TEMPLATE};
use crate::tailer::TailerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub log_dir: String,
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
    /// How often to look for appended data once the current file is drained.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaderConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub comment: Option<char>,
    #[serde(default = "default_lazy_quotes")]
    pub lazy_quotes: bool,
    #[serde(default)]
    pub trim_leading_space: bool,
    /// Records with fewer fields are fatal.
    #[serde(default = "default_min_fields")]
    pub min_fields: usize,
    /// When set, every record must have exactly this many fields.
    #[serde(default)]
    pub exact_fields: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    pub db_path: String,
    #[serde(default = "default_persist_interval_bytes")]
    pub persist_interval_bytes: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    Stdout,
    Jsonl,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub kind: ProcessorKind,
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1_000;
const DEFAULT_DELIMITER: char = ',';
const DEFAULT_LAZY_QUOTES: bool = true;
const DEFAULT_PERSIST_INTERVAL_BYTES: u64 = 32 * 1024 * 1024;

fn default_filename_template() -> String {
    DEFAULT_FILENAME_TEMPLATE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}

fn default_lazy_quotes() -> bool {
    DEFAULT_LAZY_QUOTES
}

fn default_min_fields() -> usize {
    MIN_CSVLOG_FIELDS
}

fn default_persist_interval_bytes() -> u64 {
    DEFAULT_PERSIST_INTERVAL_BYTES
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            comment: None,
            lazy_quotes: DEFAULT_LAZY_QUOTES,
            trim_leading_space: false,
            min_fields: MIN_CSVLOG_FIELDS,
            exact_fields: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.source.log_dir.trim().is_empty() {
            anyhow::bail!("source.log_dir cannot be empty");
        }
        if self.source.poll_interval_ms == 0 || self.source.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            anyhow::bail!(
                "source.poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}, got {}",
                self.source.poll_interval_ms
            );
        }
        self.rotation_pattern()?;

        let reader = &self.reader;
        if !is_valid_separator(reader.delimiter) {
            anyhow::bail!(
                "reader.delimiter must be a single ASCII character other than a quote or line break, got {:?}",
                reader.delimiter
            );
        }
        if let Some(comment) = reader.comment {
            if !is_valid_separator(comment) || comment == reader.delimiter {
                anyhow::bail!(
                    "reader.comment must be an ASCII character distinct from the delimiter, got {comment:?}"
                );
            }
        }
        if reader.min_fields == 0 {
            anyhow::bail!("reader.min_fields must be at least 1");
        }
        if let Some(exact) = reader.exact_fields {
            if exact < reader.min_fields {
                anyhow::bail!(
                    "reader.exact_fields ({exact}) cannot be below reader.min_fields ({})",
                    reader.min_fields
                );
            }
        }

        if self.checkpoint.db_path.trim().is_empty() {
            anyhow::bail!("checkpoint.db_path cannot be empty");
        }
        if self.checkpoint.persist_interval_bytes == 0 {
            anyhow::bail!("checkpoint.persist_interval_bytes must be positive");
        }

        let has_output_path = self
            .processor
            .output_path
            .as_ref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if self.processor.kind == ProcessorKind::Jsonl && !has_output_path {
            anyhow::bail!("processor kind \"jsonl\" requires processor.output_path");
        }

        self.metrics_addr()?;
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        expand_path(&self.source.log_dir)
    }

    pub fn checkpoint_db_path(&self) -> PathBuf {
        expand_path(&self.checkpoint.db_path)
    }

    pub fn rotation_pattern(&self) -> Result<RotationPattern> {
        RotationPattern::from_template(&self.source.filename_template).with_context(|| {
            format!(
                "invalid source.filename_template {:?}",
                self.source.filename_template
            )
        })
    }

    pub fn reader_options(&self) -> ReaderOptions {
        let fields_per_record = match self.reader.exact_fields {
            Some(count) => FieldsPerRecord::Exactly(count),
            None => FieldsPerRecord::Any,
        };
        // Validation keeps both characters in the ASCII range.
        ReaderOptions {
            delimiter: self.reader.delimiter as u8,
            comment: self.reader.comment.map(|ch| ch as u8),
            lazy_quotes: self.reader.lazy_quotes,
            trim_leading_space: self.reader.trim_leading_space,
            require_trailing_newline: true,
            fields_per_record,
        }
    }

    pub fn tailer_config(&self) -> TailerConfig {
        TailerConfig {
            log_dir: self.log_dir(),
            poll_interval: Duration::from_millis(self.source.poll_interval_ms),
            persist_interval_bytes: self.checkpoint.persist_interval_bytes,
            min_fields: self.reader.min_fields,
            reader: self.reader_options(),
        }
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics
            .listen_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("invalid metrics.listen_addr {addr:?}"))
            })
            .transpose()
    }
}

impl ProcessorConfig {
    pub fn output_path(&self) -> Option<PathBuf> {
        self.output_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(expand_path)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    PathBuf::from(expanded.as_ref())
}

fn is_valid_separator(ch: char) -> bool {
    ch.is_ascii() && !matches!(ch, '"' | '\r' | '\n')
}
