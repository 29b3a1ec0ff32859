//! Test harness for migration directories run against a throwaway SQLite database.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::ScriptKind;
use crate::sqlite::SqliteProvider;
use crate::transaction::Transaction;
use crate::value::{Row, SqlValue};
use crate::{Error, MigrationConfig, MigrationService};

/// A temporary directory holding a SQLite database file and a migration root.
///
/// # Example
///
/// ```
/// # #[cfg(not(feature = "testing"))]
/// # fn main() {}
/// # #[cfg(feature = "testing")]
/// # fn main() -> Result<(), shiftlog::Error> {
/// use shiftlog::testing::sqlite::SqliteTestHarness;
///
/// let harness = SqliteTestHarness::new()?;
/// harness.add_migration(
///     "001-users",
///     "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
///     "DROP TABLE users;",
/// )?;
///
/// let report = harness.service().setup()?;
/// assert_eq!(report.applied, vec!["001-users"]);
///
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
/// let name = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, Some("alice".into()));
/// # Ok(())
/// # }
/// ```
pub struct SqliteTestHarness {
    dir: TempDir,
    provider: SqliteProvider,
}

impl SqliteTestHarness {
    pub fn new() -> Result<Self, Error> {
        let dir = tempfile::tempdir().map_err(|source| Error::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        let root = dir.path().join("migrations");
        fs::create_dir(&root).map_err(|source| Error::Io { path: root, source })?;
        let provider = SqliteProvider::new(dir.path().join("test.db"));
        Ok(Self { dir, provider })
    }

    pub fn provider(&self) -> &SqliteProvider {
        &self.provider
    }

    pub fn migrations_root(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    pub fn config(&self) -> MigrationConfig {
        MigrationConfig {
            migrations_root: self.migrations_root(),
        }
    }

    /// A service over the harness database and migration root.
    pub fn service(&self) -> MigrationService<SqliteProvider> {
        MigrationService::new(self.provider.clone(), self.config())
    }

    /// Write a migration directory and return its path.
    pub fn add_migration(&self, name: &str, change: &str, rollback: &str) -> Result<PathBuf, Error> {
        let dir = self.migrations_root().join(name);
        fs::create_dir_all(&dir).map_err(|source| Error::Io {
            path: dir.clone(),
            source,
        })?;
        self.write_script(name, ScriptKind::Change, change)?;
        self.write_script(name, ScriptKind::Rollback, rollback)?;
        Ok(dir)
    }

    /// Overwrite one script of an existing migration.
    pub fn write_script(&self, name: &str, kind: ScriptKind, body: &str) -> Result<(), Error> {
        let path = self.migrations_root().join(name).join(kind.file_name());
        fs::write(&path, body).map_err(|source| Error::Io { path, source })
    }

    /// Execute SQL outside of any migration, committing it.
    pub fn execute(&self, sql: &str) -> Result<(), Error> {
        let mut tx = Transaction::begin(&self.provider)?;
        tx.query(sql, &[])?;
        tx.commit()
    }

    /// Rows returned by a query.
    pub fn query_all(&self, sql: &str) -> Result<Vec<Row>, Error> {
        let mut tx = Transaction::begin(&self.provider)?;
        let result = tx.query(sql, &[])?;
        tx.rollback()?;
        Ok(result.results)
    }

    /// First column of the first row, if any.
    pub fn query_one(&self, sql: &str) -> Result<Option<SqlValue>, Error> {
        Ok(self
            .query_all(sql)?
            .first()
            .and_then(|row| row.values().first().cloned()))
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, Error> {
        let mut tx = Transaction::begin(&self.provider)?;
        let result = tx.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = $1",
            &[table_name.into()],
        )?;
        tx.rollback()?;
        Ok(!result.results.is_empty())
    }

    /// Assert that a table exists in the database.
    pub fn assert_table_exists(&self, table_name: &str) -> Result<(), Error> {
        if !self.table_exists(table_name)? {
            return Err(Error::Generic(format!(
                "Table '{}' does not exist",
                table_name
            )));
        }
        Ok(())
    }

    /// Assert that a table does not exist in the database.
    pub fn assert_table_not_exists(&self, table_name: &str) -> Result<(), Error> {
        if self.table_exists(table_name)? {
            return Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
