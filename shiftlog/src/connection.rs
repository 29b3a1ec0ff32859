//! The seam between the core and a database driver.
//!
//! A [ConnectionProvider] hands out [Connection]s; a [Transaction](crate::Transaction)
//! owns one for its lifetime and gives it back through [Connection::release].

use crate::error::Error;
use crate::sql;
use crate::value::{Row, SqlValue};

/// SQL dialect spoken by a connection. Only the tracking schema DDL differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Supplies connections. Pooling, timeouts and network retries belong here,
/// not in the core.
pub trait ConnectionProvider {
    /// Dialect of the connections this provider hands out. Known before any
    /// connection is made, so input can be validated without I/O.
    fn dialect(&self) -> Dialect;

    fn connect(&self) -> Result<Box<dyn Connection>, Error>;
}

impl<P: ConnectionProvider + ?Sized> ConnectionProvider for &P {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        (**self).connect()
    }
}

impl<P: ConnectionProvider + ?Sized> ConnectionProvider for Box<P> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        (**self).connect()
    }
}

/// A single physical connection.
pub trait Connection {
    fn dialect(&self) -> Dialect;

    /// Execute exactly one statement with positional `$n` parameters.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, Error>;

    /// Give the connection back to its provider.
    fn release(self: Box<Self>) -> Result<(), Error>;
}

/// Effect of one executed statement, classified by its command tag.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    Insert(u64),
    Update(u64),
    Delete(u64),
    Select(Vec<Row>),
    /// Administrative and transaction-control statements; carries the tag.
    Other(String),
}

/// Tags that are expected to contribute nothing to the counters.
const UNCOUNTED_TAGS: &[&str] = &[
    "CALL", "DROP", "CREATE", "ALTER", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE",
];

impl StatementResult {
    /// Classify an executed statement.
    ///
    /// `tag` is the command tag (see [StatementResult::tag_of]). A statement
    /// that produced a result set is a `Select` unless it is a data-modifying
    /// statement with a `RETURNING` clause, which is counted by its tag instead.
    pub fn classify(tag: &str, affected: u64, rows: Option<Vec<Row>>) -> Self {
        match tag {
            "INSERT" => Self::Insert(affected),
            "UPDATE" => Self::Update(affected),
            "DELETE" => Self::Delete(affected),
            _ => match rows {
                Some(rows) => Self::Select(rows),
                None => {
                    if !UNCOUNTED_TAGS.contains(&tag) {
                        tracing::warn!(command = tag, "Command not fully supported");
                    }
                    Self::Other(tag.to_string())
                }
            },
        }
    }

    /// Command tag of a statement as the server would report it: the leading
    /// keyword, or for a `WITH` statement the keyword of its main statement.
    pub fn tag_of(statement: &str, dialect: Dialect) -> String {
        sql::statement_keyword(statement, dialect).unwrap_or_default()
    }
}
