//! SQLite backend built on `rusqlite`.
//!
//! Every [ConnectionProvider::connect] opens a fresh connection to the database
//! file and every [Connection::release] closes it.
//!
//! ```no_run
//! use shiftlog::sqlite::SqliteProvider;
//! use shiftlog::{MigrationConfig, MigrationService};
//!
//! # fn main() -> Result<(), shiftlog::Error> {
//! let provider = SqliteProvider::new("app.db");
//! let service = MigrationService::new(provider, MigrationConfig::default());
//! let report = service.setup()?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! Placeholders are written `$1, $2, ...` as for PostgreSQL. They are bound by
//! their number, so the order in which they appear in the statement does not
//! matter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};

use crate::connection::{Connection, ConnectionProvider, Dialect, StatementResult};
use crate::error::Error;
use crate::value::{Row, SqlValue};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Opens connections to one SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteProvider {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: Duration::from_secs(30),
        }
    }

    /// Set the busy timeout for SQLite database operations.
    /// This controls how long a connection waits for locks held by another one.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionProvider for SqliteProvider {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let connection_error =
            |e: rusqlite::Error| Error::Connection(format!("{}: {}", self.path.display(), e));
        let conn = rusqlite::Connection::open(&self.path).map_err(connection_error)?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(connection_error)?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(connection_error)?;
        tracing::trace!(path = %self.path.display(), "Opened SQLite connection");
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// A connection handed out by [SqliteProvider].
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    /// Bind `params` to the statement's placeholders by their number.
    fn bind(stmt: &mut rusqlite::Statement<'_>, params: &[SqlValue]) -> Result<(), Error> {
        for index in 1..=stmt.parameter_count() {
            let position = match stmt.parameter_name(index) {
                Some(name) => name
                    .trim_start_matches(['$', '?', ':', '@'])
                    .parse::<usize>()
                    .map_err(|_| Error::Generic(format!("Unsupported placeholder '{}'", name)))?,
                None => index,
            };
            let value = params.get(position.wrapping_sub(1)).ok_or_else(|| {
                Error::Generic(format!(
                    "Placeholder ${} has no bound value, {} provided",
                    position,
                    params.len()
                ))
            })?;
            stmt.raw_bind_parameter(index, value)?;
        }
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, Error> {
        let tag = StatementResult::tag_of(sql, Dialect::Sqlite);

        let (rows, returned) = {
            let mut stmt = self.conn.prepare(sql)?;
            Self::bind(&mut stmt, params)?;

            if stmt.column_count() == 0 {
                let affected = stmt.raw_execute()?;
                (None, affected as u64)
            } else {
                let columns: Arc<[String]> = stmt
                    .column_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let mut collected = Vec::new();
                let mut rows = stmt.raw_query();
                while let Some(row) = rows.next()? {
                    let values = (0..columns.len())
                        .map(|i| row.get_ref(i).map(from_value_ref))
                        .collect::<Result<Vec<_>, _>>()?;
                    collected.push(Row::new(Arc::clone(&columns), values));
                }
                let returned = collected.len() as u64;
                (Some(collected), returned)
            }
        };

        let affected = match tag.as_str() {
            "INSERT" | "UPDATE" | "DELETE" if rows.is_some() => self.conn.changes() as u64,
            _ => returned,
        };
        Ok(StatementResult::classify(&tag, affected, rows))
    }

    fn release(self: Box<Self>) -> Result<(), Error> {
        self.conn
            .close()
            .map_err(|(_, e)| Error::Connection(e.to_string()))
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::Timestamp(ts) => ToSqlOutput::Owned(Value::Text(format_timestamp(ts))),
        })
    }
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
