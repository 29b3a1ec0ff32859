use std::path::PathBuf;

use crate::core::ScriptKind;

/// Error type for the shiftlog crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A connection could not be acquired from, or returned to, the provider.
    #[error("connection error: {0}")]
    Connection(String),
    /// A statement was issued on a transaction that has already been ended.
    #[error("database transaction already completed")]
    TransactionClosed,
    /// `end` was called on a transaction that has already been ended.
    #[error("cannot {command} database transaction, transaction already completed")]
    TransactionAlreadyCompleted { command: &'static str },
    /// The transaction never acquired a connection (or failed to issue `BEGIN`).
    #[error("database connection not open")]
    TransactionNotOpen,
    #[error("{method} method can only be used for '{keyword}' statements")]
    WrongStatementKind {
        method: &'static str,
        keyword: &'static str,
    },
    #[error("SQL statement count exceeds allowed count. {provided} statements provided, maximum allowed is {max}")]
    TooManyStatements { provided: usize, max: usize },
    #[error("bind parameters can only be used with a single statement, {statements} statements provided")]
    ParamsWithMultipleStatements { statements: usize },
    /// A previously recorded fingerprint disagrees with the script on disk.
    #[error("migration '{name}' already has a {kind} but with a different hash")]
    IntegrityViolation { name: String, kind: ScriptKind },
    #[error("migration '{migration}' is missing its script at {}", .path.display())]
    MissingScript { migration: String, path: PathBuf },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Whether this error is the database rejecting a statement, as opposed to
    /// misuse of the API, a connection problem or a loader failure.
    pub fn is_script_execution(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Rusqlite(_) => true,
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because postgres::Error and io::Error don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Connection(a), Self::Connection(b)) => a == b,
            (Self::TransactionClosed, Self::TransactionClosed) => true,
            (
                Self::TransactionAlreadyCompleted { command: a },
                Self::TransactionAlreadyCompleted { command: b },
            ) => a == b,
            (Self::TransactionNotOpen, Self::TransactionNotOpen) => true,
            (
                Self::WrongStatementKind {
                    method: m1,
                    keyword: k1,
                },
                Self::WrongStatementKind {
                    method: m2,
                    keyword: k2,
                },
            ) => m1 == m2 && k1 == k2,
            (
                Self::TooManyStatements {
                    provided: p1,
                    max: m1,
                },
                Self::TooManyStatements {
                    provided: p2,
                    max: m2,
                },
            ) => p1 == p2 && m1 == m2,
            (
                Self::ParamsWithMultipleStatements { statements: a },
                Self::ParamsWithMultipleStatements { statements: b },
            ) => a == b,
            (
                Self::IntegrityViolation { name: n1, kind: k1 },
                Self::IntegrityViolation { name: n2, kind: k2 },
            ) => n1 == n2 && k1 == k2,
            (
                Self::MissingScript {
                    migration: m1,
                    path: p1,
                },
                Self::MissingScript {
                    migration: m2,
                    path: p2,
                },
            ) => m1 == m2 && p1 == p2,
            (Self::Io { path: p1, source: s1 }, Self::Io { path: p2, source: s2 }) => {
                p1 == p2 && s1.kind() == s2.kind()
            }
            #[cfg(feature = "sqlite")]
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}
