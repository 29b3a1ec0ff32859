use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionProvider, Dialect};
use crate::error::Error;
use crate::sql;
use crate::transaction::{PersistenceResult, Transaction};
use crate::value::SqlValue;

/// Limits and commit behaviour for [PersistenceService] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Maximum number of `;`-separated statements accepted per call.
    pub max_statements: usize,
    /// Whether data-modifying calls commit. When false they roll back.
    pub commit: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_statements: 1,
            commit: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    fn method(&self) -> &'static str {
        match self {
            Self::Select => "Select",
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Delete => "Delete",
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Single-call convenience operations, each run in its own [Transaction].
///
/// Input is validated before a connection is acquired. `select` never commits;
/// the other calls commit according to [QueryConfig::commit]. Any execution
/// error rolls the transaction back before it is returned.
#[derive(Debug, Clone)]
pub struct PersistenceService<P> {
    provider: P,
    config: QueryConfig,
}

impl<P: ConnectionProvider> PersistenceService<P> {
    pub fn new(provider: P, config: QueryConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> QueryConfig {
        self.config
    }

    /// Run `f` inside a fresh transaction.
    ///
    /// On success the transaction is committed (or rolled back when `commit` is
    /// false) unless `f` already ended it. On error it is rolled back and the
    /// original error returned; a failing rollback is only logged.
    pub fn transact<T, F>(&self, commit: bool, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Transaction) -> Result<T, Error>,
    {
        let mut tx = Transaction::begin(&self.provider)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.close_if_open(commit)?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.close_if_open(false) {
                    tracing::warn!(
                        error = %rollback_error,
                        "Rollback failed while handling a query error"
                    );
                }
                Err(error)
            }
        }
    }

    /// Run a `SELECT`. The transaction is always rolled back.
    pub fn select(&self, sql: &str, params: &[SqlValue]) -> Result<PersistenceResult, Error> {
        self.select_with(sql, params, self.config)
    }

    pub fn select_with(
        &self,
        sql: &str,
        params: &[SqlValue],
        config: QueryConfig,
    ) -> Result<PersistenceResult, Error> {
        self.run(Some(StatementKind::Select), sql, params, config.max_statements, false)
    }

    pub fn insert(&self, sql: &str, params: &[SqlValue]) -> Result<PersistenceResult, Error> {
        self.insert_with(sql, params, self.config)
    }

    pub fn insert_with(
        &self,
        sql: &str,
        params: &[SqlValue],
        config: QueryConfig,
    ) -> Result<PersistenceResult, Error> {
        self.run(Some(StatementKind::Insert), sql, params, config.max_statements, config.commit)
    }

    pub fn update(&self, sql: &str, params: &[SqlValue]) -> Result<PersistenceResult, Error> {
        self.update_with(sql, params, self.config)
    }

    pub fn update_with(
        &self,
        sql: &str,
        params: &[SqlValue],
        config: QueryConfig,
    ) -> Result<PersistenceResult, Error> {
        self.run(Some(StatementKind::Update), sql, params, config.max_statements, config.commit)
    }

    pub fn delete(&self, sql: &str, params: &[SqlValue]) -> Result<PersistenceResult, Error> {
        self.delete_with(sql, params, self.config)
    }

    pub fn delete_with(
        &self,
        sql: &str,
        params: &[SqlValue],
        config: QueryConfig,
    ) -> Result<PersistenceResult, Error> {
        self.run(Some(StatementKind::Delete), sql, params, config.max_statements, config.commit)
    }

    /// Run statements of any kind, subject only to the statement count limit.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<PersistenceResult, Error> {
        self.execute_with(sql, params, self.config)
    }

    pub fn execute_with(
        &self,
        sql: &str,
        params: &[SqlValue],
        config: QueryConfig,
    ) -> Result<PersistenceResult, Error> {
        self.run(None, sql, params, config.max_statements, config.commit)
    }

    fn run(
        &self,
        kind: Option<StatementKind>,
        sql: &str,
        params: &[SqlValue],
        max_statements: usize,
        commit: bool,
    ) -> Result<PersistenceResult, Error> {
        validate(kind, sql, max_statements, self.provider.dialect())?;
        self.transact(commit, |tx| tx.query(sql, params))
    }
}

fn validate(
    kind: Option<StatementKind>,
    sql: &str,
    max_statements: usize,
    dialect: Dialect,
) -> Result<(), Error> {
    let statements = sql::split_statements(sql, dialect);
    if statements.len() > max_statements {
        return Err(Error::TooManyStatements {
            provided: statements.len(),
            max: max_statements,
        });
    }

    if let Some(kind) = kind {
        let matches = !statements.is_empty()
            && statements.iter().all(|statement| {
                sql::is_statement_of_kind(statement, kind.keyword(), dialect)
            });
        if !matches {
            return Err(Error::WrongStatementKind {
                method: kind.method(),
                keyword: kind.keyword(),
            });
        }
    }
    Ok(())
}
