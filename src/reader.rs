//! Delimited record reader with exact byte accounting.
//!
//! `RecordReader` parses csvlog-style input (RFC 4180 quoting, configurable
//! delimiter and comment byte) and reports, for every record, how many input
//! bytes it spanned. Adding those counts to a starting offset always lands on
//! a record boundary, which is what makes a tailed file resumable.
//!
//! Bytes from skipped blank or comment lines are charged to the next record
//! returned. When `require_trailing_newline` is set, a record that is cut off
//! by the end of the input is withheld: `read` reports end-of-stream and keeps
//! the partial bytes buffered so a later call can complete it once the writer
//! has appended the rest.

use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

const FILL_CHUNK_BYTES: usize = 64 * 1024;

/// Field count policy applied to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldsPerRecord {
    #[default]
    Any,
    /// The first record fixes the count for the rest of the stream.
    FromFirst,
    Exactly(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    pub delimiter: u8,
    pub comment: Option<u8>,
    pub lazy_quotes: bool,
    pub trim_leading_space: bool,
    pub require_trailing_newline: bool,
    pub fields_per_record: FieldsPerRecord,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            comment: None,
            lazy_quotes: false,
            trim_leading_space: false,
            require_trailing_newline: false,
            fields_per_record: FieldsPerRecord::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    BareQuote,
    Quote,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::BareQuote => f.write_str("bare \" in non-quoted-field"),
            ParseErrorKind::Quote => f.write_str("extraneous \" in field"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("line {line}, column {column}: {kind}")]
    Parse {
        line: u64,
        column: u64,
        kind: ParseErrorKind,
    },
    #[error("line {line}: wrong number of fields (expected {expected}, found {found})")]
    FieldCount {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
}

/// One parsed record and the number of input bytes it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub fields: Vec<String>,
    pub bytes_consumed: u64,
}

pub struct RecordReader<R> {
    inner: R,
    options: ReaderOptions,
    buffer: Vec<u8>,
    start: usize,
    source_exhausted: bool,
    line: u64,
    expected_fields: Option<usize>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_options(inner, ReaderOptions::default())
    }

    pub fn with_options(inner: R, options: ReaderOptions) -> Self {
        let expected_fields = match options.fields_per_record {
            FieldsPerRecord::Exactly(count) => Some(count),
            FieldsPerRecord::Any | FieldsPerRecord::FromFirst => None,
        };
        Self {
            inner,
            options,
            buffer: Vec::new(),
            start: 0,
            source_exhausted: false,
            line: 0,
            expected_fields,
        }
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` at end-of-stream. Nothing is consumed in that case,
    /// so calling `read` again after the source has grown picks up from the
    /// same boundary.
    pub fn read(&mut self) -> Result<Option<ReadRecord>, ReadError> {
        loop {
            let (outcome, consumed, line) = {
                let mut scanner = Scanner::new(
                    &self.buffer[self.start..],
                    self.source_exhausted,
                    self.line,
                    &self.options,
                );
                let outcome = scanner.next_record();
                (outcome, scanner.pos, scanner.line)
            };

            match outcome {
                Ok(Some(fields)) => {
                    self.start += consumed;
                    self.line = line;
                    self.check_field_count(&fields, line)?;
                    return Ok(Some(ReadRecord {
                        fields,
                        bytes_consumed: consumed as u64,
                    }));
                }
                Ok(None) => {
                    self.source_exhausted = false;
                    return Ok(None);
                }
                Err(Stop::Incomplete) => {
                    if self.fill()? == 0 {
                        self.source_exhausted = true;
                    }
                }
                Err(Stop::Invalid(err)) => return Err(err),
            }
        }
    }

    /// Bytes pulled from the source that no returned record has consumed yet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.start
    }

    fn check_field_count(&mut self, fields: &[String], line: u64) -> Result<(), ReadError> {
        match self.expected_fields {
            Some(expected) if expected != fields.len() => Err(ReadError::FieldCount {
                line,
                expected,
                found: fields.len(),
            }),
            Some(_) => Ok(()),
            None => {
                if self.options.fields_per_record == FieldsPerRecord::FromFirst {
                    self.expected_fields = Some(fields.len());
                }
                Ok(())
            }
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.start == self.buffer.len() {
            self.buffer.clear();
            self.start = 0;
        } else if self.start >= FILL_CHUNK_BYTES {
            self.buffer.drain(..self.start);
            self.start = 0;
        }

        let len = self.buffer.len();
        self.buffer.resize(len + FILL_CHUNK_BYTES, 0);
        loop {
            match self.inner.read(&mut self.buffer[len..]) {
                Ok(read) => {
                    self.buffer.truncate(len + read);
                    return Ok(read);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buffer.truncate(len);
                    return Err(err);
                }
            }
        }
    }
}

enum Stop {
    /// Ran off the end of the buffered bytes before the record was decided.
    Incomplete,
    Invalid(ReadError),
}

enum FieldEnd {
    Delimiter,
    Newline,
    Eof,
}

struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
    at_eof: bool,
    line: u64,
    column: i64,
    options: &'a ReaderOptions,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8], at_eof: bool, line: u64, options: &'a ReaderOptions) -> Self {
        Self {
            input,
            pos: 0,
            at_eof,
            line,
            column: -1,
            options,
        }
    }

    fn next_record(&mut self) -> Result<Option<Vec<String>>, Stop> {
        loop {
            self.line += 1;
            self.column = -1;
            let record_start = self.pos;

            let Some(first) = self.read_char()? else {
                return Ok(None);
            };
            if self.options.comment == Some(first) {
                loop {
                    match self.read_char()? {
                        None => return Ok(None),
                        Some(b'\n') => break,
                        Some(_) => {}
                    }
                }
                continue;
            }
            self.pos = record_start;
            self.column = -1;

            let mut fields = Vec::new();
            let mut field = Vec::new();
            let terminated = loop {
                let (has_field, end) = self.parse_field(&mut field)?;
                if has_field {
                    fields.push(String::from_utf8_lossy(&field).into_owned());
                }
                match end {
                    FieldEnd::Delimiter => continue,
                    FieldEnd::Newline => break true,
                    FieldEnd::Eof => break false,
                }
            };

            if fields.is_empty() {
                if terminated {
                    continue;
                }
                return Ok(None);
            }
            if !terminated && self.options.require_trailing_newline {
                return Ok(None);
            }
            return Ok(Some(fields));
        }
    }

    fn parse_field(&mut self, field: &mut Vec<u8>) -> Result<(bool, FieldEnd), Stop> {
        field.clear();
        let delimiter = self.options.delimiter;

        let mut next = self.read_char()?;
        if self.options.trim_leading_space {
            while let Some(ch) = next {
                if ch != b'\n' && is_space(ch) {
                    next = self.read_char()?;
                } else {
                    break;
                }
            }
        }

        let Some(first) = next else {
            return Ok((self.column != 0, FieldEnd::Eof));
        };
        if first == delimiter {
            return Ok((true, FieldEnd::Delimiter));
        }
        if first == b'\n' {
            // Column 0 means the line was blank.
            return Ok((self.column != 0, FieldEnd::Newline));
        }
        if first == b'"' {
            return self.parse_quoted(field);
        }

        field.push(first);
        loop {
            match self.read_char()? {
                None => return Ok((true, FieldEnd::Eof)),
                Some(ch) if ch == delimiter => return Ok((true, FieldEnd::Delimiter)),
                Some(b'\n') => return Ok((true, FieldEnd::Newline)),
                Some(b'"') if !self.options.lazy_quotes => {
                    return Err(self.error(ParseErrorKind::BareQuote))
                }
                Some(ch) => field.push(ch),
            }
        }
    }

    fn parse_quoted(&mut self, field: &mut Vec<u8>) -> Result<(bool, FieldEnd), Stop> {
        let delimiter = self.options.delimiter;
        let lazy = self.options.lazy_quotes;

        loop {
            match self.read_char()? {
                None => {
                    // An open quote at end of input is a record still being written.
                    if lazy || self.options.require_trailing_newline {
                        return Ok((true, FieldEnd::Eof));
                    }
                    return Err(self.error(ParseErrorKind::Quote));
                }
                Some(b'"') => match self.read_char()? {
                    None => return Ok((true, FieldEnd::Eof)),
                    Some(ch) if ch == delimiter => return Ok((true, FieldEnd::Delimiter)),
                    Some(b'\n') => return Ok((true, FieldEnd::Newline)),
                    Some(b'"') => field.push(b'"'),
                    Some(ch) => {
                        if !lazy {
                            self.column -= 1;
                            return Err(self.error(ParseErrorKind::Quote));
                        }
                        field.push(b'"');
                        field.push(ch);
                    }
                },
                Some(b'\n') => {
                    self.line += 1;
                    self.column = -1;
                    field.push(b'\n');
                }
                Some(ch) => field.push(ch),
            }
        }
    }

    /// Next byte with `\r\n` folded into `\n`. A bare `\r` is returned as is.
    fn read_char(&mut self) -> Result<Option<u8>, Stop> {
        let Some(&byte) = self.input.get(self.pos) else {
            if self.at_eof {
                self.column += 1;
                return Ok(None);
            }
            return Err(Stop::Incomplete);
        };

        let mut ch = byte;
        let mut width = 1;
        if byte == b'\r' {
            match self.input.get(self.pos + 1) {
                Some(b'\n') => {
                    ch = b'\n';
                    width = 2;
                }
                Some(_) => {}
                None if self.at_eof => {
                    self.pos += 1;
                    self.column += 1;
                    return Ok(None);
                }
                None => return Err(Stop::Incomplete),
            }
        }

        self.pos += width;
        if !is_continuation_byte(ch) {
            self.column += 1;
        }
        Ok(Some(ch))
    }

    fn error(&self, kind: ParseErrorKind) -> Stop {
        Stop::Invalid(ReadError::Parse {
            line: self.line,
            column: self.column.max(0) as u64,
            kind,
        })
    }
}

fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | 0x0b | 0x0c)
}

fn is_continuation_byte(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}
