//! An in-process [ConnectionProvider] that records every statement it is given.
//!
//! Useful for exercising transaction and service logic without a database:
//! statements can be made to fail by substring, `SELECT`s can be given canned
//! rows, and connect/release counts can be asserted on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::{Connection, ConnectionProvider, Dialect, StatementResult};
use crate::error::Error;
use crate::value::{Row, SqlValue};

#[derive(Default)]
struct MockState {
    executed: Vec<String>,
    params: Vec<Vec<SqlValue>>,
    connects: usize,
    releases: usize,
    connect_failure: Option<(usize, String)>,
    failures: Vec<Failure>,
    rows: Vec<(String, Arc<[String]>, Vec<Vec<SqlValue>>)>,
}

struct Failure {
    pattern: String,
    exact: bool,
    message: String,
}

impl Failure {
    fn matches(&self, sql: &str) -> bool {
        if self.exact {
            sql.trim() == self.pattern
        } else {
            sql.contains(self.pattern.as_str())
        }
    }
}

/// Mock connection provider. Clones share their recorded state.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every statement containing `pattern` fail with `message`.
    pub fn fail_on(&self, pattern: &str, message: &str) {
        self.state().failures.push(Failure {
            pattern: pattern.to_string(),
            exact: false,
            message: message.to_string(),
        });
    }

    /// Make every statement equal to `statement` fail with `message`.
    pub fn fail_on_statement(&self, statement: &str, message: &str) {
        self.state().failures.push(Failure {
            pattern: statement.to_string(),
            exact: true,
            message: message.to_string(),
        });
    }

    /// Make [ConnectionProvider::connect] fail with `message`.
    pub fn fail_connect(&self, message: &str) {
        self.fail_connect_after(0, message);
    }

    /// Let `successful` connects through, then fail every later one with `message`.
    pub fn fail_connect_after(&self, successful: usize, message: &str) {
        self.state().connect_failure = Some((successful, message.to_string()));
    }

    /// Return `rows` for every `SELECT` containing `pattern`.
    pub fn return_rows(&self, pattern: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        let columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
        self.state()
            .rows
            .push((pattern.to_string(), columns, rows));
    }

    /// Every statement received, in order, across all connections.
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Parameters bound to each statement in [MockProvider::executed].
    pub fn params(&self) -> Vec<Vec<SqlValue>> {
        self.state().params.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }
}

impl ConnectionProvider for MockProvider {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let mut state = self.state();
        if let Some((successful, message)) = &state.connect_failure {
            if state.connects >= *successful {
                return Err(Error::Connection(message.clone()));
            }
        }
        state.connects += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.executed.push(sql.to_string());
        state.params.push(params.to_vec());

        if let Some(failure) = state.failures.iter().find(|failure| failure.matches(sql)) {
            return Err(Error::Generic(failure.message.clone()));
        }

        let tag = StatementResult::tag_of(sql, Dialect::Sqlite);
        let rows = if tag == "SELECT" {
            let rows = state
                .rows
                .iter()
                .find(|(pattern, _, _)| sql.contains(pattern.as_str()))
                .map(|(_, columns, rows)| {
                    rows.iter()
                        .map(|values| Row::new(Arc::clone(columns), values.clone()))
                        .collect()
                })
                .unwrap_or_default();
            Some(rows)
        } else {
            None
        };
        let affected = match tag.as_str() {
            "INSERT" | "UPDATE" | "DELETE" => 1,
            _ => 0,
        };
        Ok(StatementResult::classify(&tag, affected, rows))
    }

    fn release(self: Box<Self>) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .releases += 1;
        Ok(())
    }
}
