use std::mem;

use crate::connection::{Connection, ConnectionProvider, Dialect, StatementResult};
use crate::error::Error;
use crate::sql;
use crate::value::{Row, SqlValue};

/// Aggregated effect of the statements executed by one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistenceResult {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Rows returned by `SELECT` statements, in execution order.
    pub results: Vec<Row>,
}

impl PersistenceResult {
    /// Fold one statement's effect into the aggregate.
    pub fn absorb(&mut self, statement: StatementResult) {
        match statement {
            StatementResult::Insert(n) => self.inserted += n,
            StatementResult::Update(n) => self.updated += n,
            StatementResult::Delete(n) => self.deleted += n,
            StatementResult::Select(rows) => self.results.extend(rows),
            StatementResult::Other(_) => {}
        }
    }

    pub fn merge(mut self, other: PersistenceResult) -> Self {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.results.extend(other.results);
        self
    }
}

enum State {
    /// No connection acquired yet.
    Pending,
    /// `BEGIN` issued on the owned connection.
    Open(Box<dyn Connection>),
    /// `COMMIT` or `ROLLBACK` issued and the connection released.
    Complete,
}

/// A unit of work on one exclusively owned connection.
///
/// The lifecycle is `Pending -> Open -> Complete`. Once complete, every further
/// statement or terminal call is rejected. The connection is released exactly
/// once: by [Transaction::end], or by `Drop` (after a rollback) if the
/// transaction is abandoned while open.
pub struct Transaction {
    state: State,
}

impl Transaction {
    /// Create a transaction that has not acquired a connection yet.
    pub fn new() -> Self {
        Self {
            state: State::Pending,
        }
    }

    /// Acquire a connection from `provider` and issue `BEGIN`.
    pub fn begin<P: ConnectionProvider + ?Sized>(provider: &P) -> Result<Self, Error> {
        let mut transaction = Self::new();
        transaction.open(provider)?;
        Ok(transaction)
    }

    /// Acquire a connection and issue `BEGIN` on a pending transaction.
    ///
    /// If `BEGIN` fails the connection is released again and the transaction
    /// stays pending.
    pub fn open<P: ConnectionProvider + ?Sized>(&mut self, provider: &P) -> Result<(), Error> {
        match self.state {
            State::Pending => {}
            State::Open(_) => {
                return Err(Error::Generic(
                    "database transaction already open".to_string(),
                ))
            }
            State::Complete => return Err(Error::TransactionClosed),
        }

        let mut connection = provider.connect()?;
        if let Err(error) = connection.query("BEGIN", &[]) {
            if let Err(release_error) = connection.release() {
                tracing::warn!(
                    error = %release_error,
                    "Failed to release connection after BEGIN failed"
                );
            }
            return Err(error);
        }

        tracing::trace!("Transaction opened");
        self.state = State::Open(connection);
        Ok(())
    }

    /// Whether `BEGIN` has been issued and the transaction has not been ended.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Dialect of the connection this transaction owns.
    pub fn dialect(&self) -> Result<Dialect, Error> {
        match &self.state {
            State::Open(connection) => Ok(connection.dialect()),
            State::Complete => Err(Error::TransactionClosed),
            State::Pending => Err(Error::TransactionNotOpen),
        }
    }

    /// Execute one or more `;`-separated statements inside the transaction.
    ///
    /// Bind parameters are only accepted together with a single statement.
    /// Counts and rows of all statements are summed in execution order; the
    /// first failing statement aborts the call with the driver's error.
    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<PersistenceResult, Error> {
        let connection = self.connection()?;

        let statements = sql::split_statements(sql, connection.dialect());
        if statements.len() > 1 && !params.is_empty() {
            return Err(Error::ParamsWithMultipleStatements {
                statements: statements.len(),
            });
        }

        let mut result = PersistenceResult::default();
        for statement in statements {
            result.absorb(connection.query(statement, params)?);
        }
        Ok(result)
    }

    /// Commit the transaction and release the connection.
    pub fn commit(&mut self) -> Result<(), Error> {
        self.end(true)
    }

    /// Roll back the transaction and release the connection.
    pub fn rollback(&mut self) -> Result<(), Error> {
        self.end(false)
    }

    /// Issue `COMMIT` (or `ROLLBACK`) and release the connection.
    ///
    /// The connection is released even when the terminal statement fails; that
    /// statement's error is still returned.
    pub fn end(&mut self, commit: bool) -> Result<(), Error> {
        let command = if commit { "COMMIT" } else { "ROLLBACK" };

        let mut connection = match mem::replace(&mut self.state, State::Complete) {
            State::Open(connection) => connection,
            State::Complete => return Err(Error::TransactionAlreadyCompleted { command }),
            State::Pending => {
                self.state = State::Pending;
                return Err(Error::TransactionNotOpen);
            }
        };

        let outcome = connection.query(command, &[]);
        let released = connection.release();

        match (outcome, released) {
            (Ok(_), Ok(())) => {
                tracing::trace!(command, "Transaction completed");
                Ok(())
            }
            (Err(error), Ok(())) | (Ok(_), Err(error)) => Err(error),
            (Err(error), Err(release_error)) => {
                tracing::warn!(
                    error = %release_error,
                    command,
                    "Failed to release connection after terminal statement failed"
                );
                Err(error)
            }
        }
    }

    /// [Transaction::end] if the transaction is still open, otherwise nothing.
    pub fn close_if_open(&mut self, commit: bool) -> Result<(), Error> {
        if self.is_open() {
            self.end(commit)
        } else {
            Ok(())
        }
    }

    fn connection(&mut self) -> Result<&mut Box<dyn Connection>, Error> {
        match &mut self.state {
            State::Open(connection) => Ok(connection),
            State::Complete => Err(Error::TransactionClosed),
            State::Pending => Err(Error::TransactionNotOpen),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Pending => "pending",
            State::Open(_) => "open",
            State::Complete => "complete",
        };
        f.debug_struct("Transaction").field("state", &state).finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_open() {
            tracing::warn!("Open transaction dropped, rolling back");
            if let Err(error) = self.end(false) {
                tracing::warn!(error = %error, "Rollback of dropped transaction failed");
            }
        }
    }
}
