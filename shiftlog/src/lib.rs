#![cfg_attr(docsrs, feature(doc_cfg))]
//! `shiftlog` runs hand-written SQL migrations and keeps a verified record of them.
//!
//! Core concepts:
//! - A migration is a directory holding a `change.sql` and a `rollback.sql`.
//!   Directories are applied in name order.
//! - Every script runs in its own transaction, together with the bookkeeping
//!   that records its outcome. A run stops at the first failing script.
//! - The content of each script is fingerprinted (SHA-256) when first recorded.
//!   Editing a recorded script is detected on the next run and aborts it before
//!   anything executes.
//!
//! # Layout
//!
//! ```text
//! migrations/
//! ├── 001-create-users/
//! │   ├── change.sql
//! │   └── rollback.sql
//! └── 002-add-email/
//!     ├── change.sql
//!     └── rollback.sql
//! ```
//!
//! # Usage
//!
//! ```no_run
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> Result<(), shiftlog::Error> {
//! use shiftlog::sqlite::SqliteProvider;
//! use shiftlog::{MigrationConfig, MigrationService};
//!
//! let service = MigrationService::new(SqliteProvider::new("app.db"), MigrationConfig::default());
//!
//! let report = service.setup()?;
//! if let Some(failure) = &report.failure {
//!     eprintln!("{} {} {}: {}", failure.name, failure.kind, failure.state, failure.error);
//! }
//!
//! // Roll everything back, last migration first
//! service.clear()?.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! Lower level access is available through [PersistenceService], which runs
//! single validated statements, and [Transaction], which owns one connection
//! for a unit of work.
//!
//! # Tracking tables
//!
//! `migration`, `change`, `rollback` and `history` are created on first use.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default).
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! Other databases can be plugged in by implementing [ConnectionProvider].
//!
//! # Logging
//!
//! Progress is reported through `tracing`: one `migration` span per script,
//! `info` events on start and completion, `error` on failure and `warn` for
//! secondary failures during cleanup.

mod connection;
pub use connection::{Connection, ConnectionProvider, Dialect, StatementResult};

mod core;
pub use self::core::{
    fingerprint, HistoryEntry, ItemRecord, ItemStatus, Migration, MigrationItem, MigrationRecord,
    MigrationState, OnFailure, RunFailure, RunReport, ScriptKind,
};

mod error;
pub use error::Error;

pub mod sql;

mod value;
pub use value::{Row, SqlValue};

mod transaction;
pub use transaction::{PersistenceResult, Transaction};

mod persistence;
pub use persistence::{PersistenceService, QueryConfig};

mod loader;
pub use loader::MigrationLoader;

mod repository;
pub use repository::MigrationRepository;

mod service;
pub use service::{MigrationConfig, MigrationService};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
