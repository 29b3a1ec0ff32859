use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Which of the two scripts of a migration an item holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Change,
    Rollback,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "CHANGE",
            Self::Rollback => "ROLLBACK",
        }
    }

    /// File name of the script inside a migration directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Change => "change.sql",
            Self::Rollback => "rollback.sql",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Change => f.write_str("change"),
            Self::Rollback => f.write_str("rollback"),
        }
    }
}

impl FromStr for ScriptKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHANGE" => Ok(Self::Change),
            "ROLLBACK" => Ok(Self::Rollback),
            other => Err(Error::Generic(format!("Unknown script kind '{}'", other))),
        }
    }
}

/// Execution status of a change or rollback script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Queued,
    Success,
    Failure,
    Ignored,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Ignored => "IGNORED",
        }
    }

    /// Status an item is created with at load time. Rollbacks are not run
    /// unless the operator asks for them.
    pub fn initial(kind: ScriptKind) -> Self {
        match kind {
            ScriptKind::Change => Self::Queued,
            ScriptKind::Rollback => Self::Ignored,
        }
    }

    pub fn from_outcome(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "IGNORED" => Ok(Self::Ignored),
            other => Err(Error::Generic(format!("Unknown migration status '{}'", other))),
        }
    }
}

/// Stored per-migration failure preference. Recorded for operators; the runner
/// itself always stops at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    Skip,
    Rollback,
    #[default]
    Fail,
}

impl OnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "SKIP",
            Self::Rollback => "ROLLBACK",
            Self::Fail => "FAIL",
        }
    }
}

impl FromStr for OnFailure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SKIP" => Ok(Self::Skip),
            "ROLLBACK" => Ok(Self::Rollback),
            "FAIL" => Ok(Self::Fail),
            other => Err(Error::Generic(format!("Unknown failure action '{}'", other))),
        }
    }
}

/// One script of a migration together with its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationItem {
    pub migration_id: String,
    pub kind: ScriptKind,
    pub script: String,
    /// SHA-256 of the raw script bytes, hex encoded.
    pub fingerprint: String,
    pub status: ItemStatus,
    pub executed_at: Option<NaiveDateTime>,
    /// Where the script was read from.
    pub path: PathBuf,
}

impl MigrationItem {
    pub fn new(migration_id: &str, kind: ScriptKind, script: String, path: PathBuf) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            kind,
            fingerprint: fingerprint(&script),
            script,
            status: ItemStatus::initial(kind),
            executed_at: None,
            path,
        }
    }
}

/// A named pair of change and rollback scripts loaded from one directory.
///
/// Identity is by `name`. The `id` is generated on every load and is only used
/// to link the pair and as a foreign key while the metadata is first saved.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub id: String,
    pub name: String,
    /// Position in the sorted directory listing, when loaded as part of a set.
    pub execution_order: Option<i64>,
    pub change: MigrationItem,
    pub rollback: MigrationItem,
}

impl Migration {
    pub fn item(&self, kind: ScriptKind) -> &MigrationItem {
        match kind {
            ScriptKind::Change => &self.change,
            ScriptKind::Rollback => &self.rollback,
        }
    }
}

/// Calculate the fingerprint of a script body.
/// This is used to verify that scripts haven't been modified after being recorded.
pub fn fingerprint(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stored tracking state of one migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub id: String,
    pub name: String,
    pub execution_order: Option<i64>,
    pub on_failure: OnFailure,
    pub change: Option<ItemRecord>,
    pub rollback: Option<ItemRecord>,
}

impl MigrationRecord {
    /// Whether the change script is currently applied to the database.
    pub fn is_applied(&self) -> bool {
        self.change
            .as_ref()
            .is_some_and(|change| change.status == ItemStatus::Success)
    }
}

/// Stored state of one change or rollback row.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub hash: String,
    pub status: ItemStatus,
    pub executed_at: Option<NaiveDateTime>,
}

/// One attempt to run a script, as recorded in the history table.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub migration_id: String,
    pub name: String,
    pub action: ScriptKind,
    pub status: ItemStatus,
    pub executed_at: Option<NaiveDateTime>,
}

/// Where a migration ended up during a sequential run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Applying,
    /// The script ran and its transaction committed.
    Applied,
    /// The script failed and its transaction was rolled back.
    RolledBack,
    /// The script failed and rolling back its transaction failed too.
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Represents the migration that stopped a sequential run.
#[derive(Debug, PartialEq)]
pub struct RunFailure {
    pub name: String,
    pub kind: ScriptKind,
    pub state: MigrationState,
    pub error: Error,
}

/// A report of actions performed during a sequential run.
#[derive(Debug, Default, PartialEq)]
pub struct RunReport {
    /// Migrations whose script ran and committed, in execution order.
    pub applied: Vec<String>,
    /// Migrations that needed no work.
    pub skipped: Vec<String>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Turn a report with a failure into the failure's error.
    pub fn into_result(self) -> Result<Self, Error> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self),
        }
    }
}
