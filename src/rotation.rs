//! Filename matching for timestamped log rotation.
//!
//! PostgreSQL names rotated logs from a strftime-style template such as
//! `postgresql-%Y-%m-%d_%H%M%S.csv`. Only fixed-width numeric placeholders
//! are accepted, because the tail loop relies on plain byte-wise filename
//! ordering matching creation order.

use glob::{MatchOptions, Pattern, PatternError};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_FILENAME_TEMPLATE: &str = "postgresql-%Y-%m-%d_%H%M%S.csv";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unsupported placeholder %{0} in filename template (supported: %Y %y %m %d %H %M %S %j %%)")]
    Unsupported(char),
    #[error("filename template ends with a dangling %")]
    Dangling,
    #[error("filename template must be a bare filename, got {0:?}")]
    NotAFilename(String),
    #[error("invalid glob derived from filename template: {0}")]
    Glob(#[from] PatternError),
}

#[derive(Debug, Clone)]
pub struct RotationPattern {
    template: String,
    glob: String,
    pattern: Pattern,
}

impl RotationPattern {
    pub fn from_template(template: &str) -> Result<Self, TemplateError> {
        if template.is_empty() || template.contains('/') || template.contains('\\') {
            return Err(TemplateError::NotAFilename(template.to_string()));
        }

        let mut glob = String::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                literal.push(ch);
                continue;
            }
            let placeholder = chars.next().ok_or(TemplateError::Dangling)?;
            let width = match placeholder {
                '%' => {
                    literal.push('%');
                    continue;
                }
                'Y' => 4,
                'j' => 3,
                'y' | 'm' | 'd' | 'H' | 'M' | 'S' => 2,
                other => return Err(TemplateError::Unsupported(other)),
            };
            glob.push_str(&Pattern::escape(&literal));
            literal.clear();
            for _ in 0..width {
                glob.push_str("[0-9]");
            }
        }
        glob.push_str(&Pattern::escape(&literal));

        let pattern = Pattern::new(&glob)?;
        Ok(Self {
            template: template.to_string(),
            glob,
            pattern,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.pattern.matches_with(filename, MATCH_OPTIONS)
    }

    /// The bare filename of `path` when it matches the template.
    pub fn match_path(&self, path: &Path) -> Option<String> {
        let filename = path.file_name()?.to_str()?;
        self.matches(filename).then(|| filename.to_string())
    }
}
