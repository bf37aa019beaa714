//! Typed access to the columns of a PostgreSQL csvlog record.

use thiserror::Error;

/// Every supported server version writes at least the columns up to and
/// including `application_name`.
pub const MIN_CSVLOG_FIELDS: usize = Column::ApplicationName as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    LogTime,
    UserName,
    DatabaseName,
    ProcessId,
    ConnectionFrom,
    SessionId,
    SessionLineNum,
    CommandTag,
    SessionStartTime,
    VirtualTransactionId,
    TransactionId,
    ErrorSeverity,
    SqlState,
    Message,
    Detail,
    Hint,
    InternalQuery,
    InternalQueryPos,
    Context,
    Query,
    QueryPos,
    Location,
    ApplicationName,
    BackendType,
    LeaderPid,
    QueryId,
}

pub const COLUMN_NAMES: [&str; 26] = [
    "log_time",
    "user_name",
    "database_name",
    "process_id",
    "connection_from",
    "session_id",
    "session_line_num",
    "command_tag",
    "session_start_time",
    "virtual_transaction_id",
    "transaction_id",
    "error_severity",
    "sql_state_code",
    "message",
    "detail",
    "hint",
    "internal_query",
    "internal_query_pos",
    "context",
    "query",
    "query_pos",
    "location",
    "application_name",
    "backend_type",
    "leader_pid",
    "query_id",
];

impl Column {
    pub fn name(self) -> &'static str {
        COLUMN_NAMES[self as usize]
    }
}

#[derive(Debug, Error)]
#[error("unexpected record length of {found}; expected at least {}", MIN_CSVLOG_FIELDS)]
pub struct RecordLengthError {
    pub found: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    record: &'a [String],
}

impl<'a> LogEntry<'a> {
    pub fn new(record: &'a [String]) -> Result<Self, RecordLengthError> {
        if record.len() < MIN_CSVLOG_FIELDS {
            return Err(RecordLengthError {
                found: record.len(),
            });
        }
        Ok(Self { record })
    }

    /// Raw column text, or `None` for a column this server version does not write.
    pub fn get(&self, column: Column) -> Option<&'a str> {
        self.record.get(column as usize).map(String::as_str)
    }

    fn text(&self, column: Column) -> &'a str {
        self.get(column).unwrap_or_default()
    }

    fn number(&self, column: Column) -> Option<i64> {
        self.get(column).and_then(|raw| raw.parse().ok())
    }

    pub fn log_time(&self) -> &'a str {
        self.text(Column::LogTime)
    }

    pub fn user_name(&self) -> &'a str {
        self.text(Column::UserName)
    }

    pub fn database_name(&self) -> &'a str {
        self.text(Column::DatabaseName)
    }

    pub fn process_id(&self) -> Option<i64> {
        self.number(Column::ProcessId)
    }

    pub fn connection_from(&self) -> &'a str {
        self.text(Column::ConnectionFrom)
    }

    pub fn session_id(&self) -> &'a str {
        self.text(Column::SessionId)
    }

    pub fn session_line_num(&self) -> Option<i64> {
        self.number(Column::SessionLineNum)
    }

    pub fn command_tag(&self) -> &'a str {
        self.text(Column::CommandTag)
    }

    pub fn session_start_time(&self) -> &'a str {
        self.text(Column::SessionStartTime)
    }

    pub fn virtual_transaction_id(&self) -> &'a str {
        self.text(Column::VirtualTransactionId)
    }

    pub fn transaction_id(&self) -> Option<i64> {
        self.number(Column::TransactionId)
    }

    pub fn error_severity(&self) -> &'a str {
        self.text(Column::ErrorSeverity)
    }

    pub fn sql_state(&self) -> &'a str {
        self.text(Column::SqlState)
    }

    pub fn message(&self) -> &'a str {
        self.text(Column::Message)
    }

    pub fn detail(&self) -> &'a str {
        self.text(Column::Detail)
    }

    pub fn hint(&self) -> &'a str {
        self.text(Column::Hint)
    }

    pub fn internal_query(&self) -> &'a str {
        self.text(Column::InternalQuery)
    }

    pub fn internal_query_pos(&self) -> Option<i64> {
        self.number(Column::InternalQueryPos)
    }

    pub fn context(&self) -> &'a str {
        self.text(Column::Context)
    }

    pub fn query(&self) -> &'a str {
        self.text(Column::Query)
    }

    pub fn query_pos(&self) -> Option<i64> {
        self.number(Column::QueryPos)
    }

    pub fn location(&self) -> &'a str {
        self.text(Column::Location)
    }

    pub fn application_name(&self) -> &'a str {
        self.text(Column::ApplicationName)
    }

    pub fn backend_type(&self) -> Option<&'a str> {
        self.get(Column::BackendType)
    }

    pub fn leader_pid(&self) -> Option<i64> {
        self.number(Column::LeaderPid)
    }

    pub fn query_id(&self) -> Option<i64> {
        self.number(Column::QueryId)
    }

    /// Named columns present in the record, in csvlog order.
    pub fn columns(&self) -> impl Iterator<Item = (&'static str, &'a str)> + '_ {
        COLUMN_NAMES
            .iter()
            .zip(self.record.iter())
            .map(|(name, value)| (*name, value.as_str()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn csvlog_record(message: &str) -> Vec<String> {
        let mut record = vec![String::new(); MIN_CSVLOG_FIELDS];
        record[Column::LogTime as usize] = "2024-01-01 00:00:00.000 UTC".into();
        record[Column::UserName as usize] = "postgres".into();
        record[Column::DatabaseName as usize] = "app".into();
        record[Column::ProcessId as usize] = "4242".into();
        record[Column::SessionId as usize] = "65920c30.1092".into();
        record[Column::SessionLineNum as usize] = "7".into();
        record[Column::ErrorSeverity as usize] = "LOG".into();
        record[Column::SqlState as usize] = "00000".into();
        record[Column::Message as usize] = message.into();
        record[Column::ApplicationName as usize] = "psql".into();
        record
    }

    #[test]
    fn requires_application_name_column() {
        let short = vec![String::new(); MIN_CSVLOG_FIELDS - 1];
        let err = LogEntry::new(&short).unwrap_err();
        assert_eq!(err.found, 22);
        assert_eq!(MIN_CSVLOG_FIELDS, 23);
    }

    #[test]
    fn accessors_read_their_own_columns() {
        let record = csvlog_record("connection received");
        let entry = LogEntry::new(&record).unwrap();
        assert_eq!(entry.message(), "connection received");
        assert_eq!(entry.session_id(), "65920c30.1092");
        assert_eq!(entry.database_name(), "app");
        assert_eq!(entry.process_id(), Some(4242));
        assert_eq!(entry.session_line_num(), Some(7));
        assert_eq!(entry.application_name(), "psql");
    }

    #[test]
    fn empty_or_absent_columns_do_not_panic() {
        let record = csvlog_record("x");
        let entry = LogEntry::new(&record).unwrap();
        assert_eq!(entry.transaction_id(), None);
        assert_eq!(entry.query_pos(), None);
        assert_eq!(entry.backend_type(), None);
        assert_eq!(entry.query_id(), None);

        let mut longer = record.clone();
        longer.push("client backend".into());
        let entry = LogEntry::new(&longer).unwrap();
        assert_eq!(entry.backend_type(), Some("client backend"));
        assert_eq!(entry.columns().count(), 24);
        assert_eq!(entry.columns().last(), Some(("backend_type", "client backend")));
    }
}
