//! Tracking tables: schema bootstrap, metadata persistence with fingerprint
//! verification, status updates and the execution history.
//!
//! Every operation runs inside a caller-supplied [Transaction] so that metadata
//! writes share atomicity with the script they describe.

use crate::connection::Dialect;
use crate::core::{
    HistoryEntry, ItemRecord, ItemStatus, Migration, MigrationItem, MigrationRecord, ScriptKind,
};
use crate::error::Error;
use crate::transaction::Transaction;
use crate::value::{Row, SqlValue};

const STATUS_CHECK: &str = "'QUEUED', 'SUCCESS', 'FAILURE', 'IGNORED'";

const RECORD_QUERY: &str = r#"SELECT m.id, m.name, m.execution_order, m.on_failure,
       c.hash AS change_hash, c.status AS change_status, c.executed_at AS change_executed_at,
       r.hash AS rollback_hash, r.status AS rollback_status, r.executed_at AS rollback_executed_at
FROM "migration" m
LEFT JOIN "change" c ON c.migration_id = m.id
LEFT JOIN "rollback" r ON r.migration_id = m.id"#;

fn schema(dialect: Dialect) -> String {
    let (timestamp, history_id) = match dialect {
        Dialect::Sqlite => ("TEXT", "INTEGER PRIMARY KEY AUTOINCREMENT"),
        Dialect::Postgres => ("TIMESTAMP", "BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY"),
    };
    let item_table = |table: &str, default_status: &str| {
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
    migration_id TEXT PRIMARY KEY REFERENCES "migration" (id),
    hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT '{default_status}' CHECK (status IN ({STATUS_CHECK})),
    script TEXT NOT NULL,
    created_at {timestamp} NOT NULL DEFAULT CURRENT_TIMESTAMP,
    executed_at {timestamp}
);"#
        )
    };

    format!(
        r#"CREATE TABLE IF NOT EXISTS "migration" (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    execution_order BIGINT,
    on_failure TEXT NOT NULL DEFAULT 'FAIL' CHECK (on_failure IN ('SKIP', 'ROLLBACK', 'FAIL'))
);
{change}
{rollback}
CREATE TABLE IF NOT EXISTS "history" (
    id {history_id},
    migration_id TEXT NOT NULL REFERENCES "migration" (id),
    action TEXT NOT NULL CHECK (action IN ('CHANGE', 'ROLLBACK')),
    status TEXT NOT NULL CHECK (status IN ({STATUS_CHECK})),
    executed_at {timestamp} NOT NULL DEFAULT CURRENT_TIMESTAMP
);"#,
        change = item_table("change", ItemStatus::Queued.as_str()),
        rollback = item_table("rollback", ItemStatus::Ignored.as_str()),
    )
}

fn item_table(kind: ScriptKind) -> &'static str {
    match kind {
        ScriptKind::Change => "change",
        ScriptKind::Rollback => "rollback",
    }
}

/// Reads and writes the `migration`, `change`, `rollback` and `history` tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationRepository;

impl MigrationRepository {
    pub fn new() -> Self {
        Self
    }

    /// Create the tracking tables if they do not exist yet.
    pub fn ensure_schema(&self, tx: &mut Transaction) -> Result<(), Error> {
        let dialect = tx.dialect()?;
        tx.query(&schema(dialect), &[])?;
        Ok(())
    }

    /// [MigrationRepository::save_one] for each migration, in order.
    pub fn save_all(
        &self,
        tx: &mut Transaction,
        migrations: &[Migration],
    ) -> Result<Vec<String>, Error> {
        migrations
            .iter()
            .map(|migration| self.save_one(tx, migration))
            .collect()
    }

    /// Record a migration, or verify it against what was recorded before.
    ///
    /// Returns the id the migration is stored under. For a migration recorded
    /// by an earlier load this is the stored id, not the freshly generated one.
    /// A stored change or rollback fingerprint that differs from the loaded one
    /// fails with [Error::IntegrityViolation]. A missing change or rollback row
    /// is inserted before the comparison.
    pub fn save_one(&self, tx: &mut Transaction, migration: &Migration) -> Result<String, Error> {
        match self.find_by_name(tx, &migration.name)? {
            None => {
                tracing::debug!(name = %migration.name, "Recording new migration");
                tx.query(
                    r#"INSERT INTO "migration" (id, name, execution_order) VALUES ($1, $2, $3)"#,
                    &[
                        migration.id.as_str().into(),
                        migration.name.as_str().into(),
                        migration.execution_order.into(),
                    ],
                )?;
                self.insert_item(tx, &migration.id, &migration.change)?;
                self.insert_item(tx, &migration.id, &migration.rollback)?;
                Ok(migration.id.clone())
            }
            Some(record) => {
                for (stored, loaded) in [
                    (&record.change, &migration.change),
                    (&record.rollback, &migration.rollback),
                ] {
                    let hash = match stored {
                        Some(stored) => &stored.hash,
                        None => {
                            self.insert_item(tx, &record.id, loaded)?;
                            &loaded.fingerprint
                        }
                    };
                    if *hash != loaded.fingerprint {
                        return Err(Error::IntegrityViolation {
                            name: migration.name.clone(),
                            kind: loaded.kind,
                        });
                    }
                }
                Ok(record.id)
            }
        }
    }

    fn insert_item(
        &self,
        tx: &mut Transaction,
        migration_id: &str,
        item: &MigrationItem,
    ) -> Result<(), Error> {
        let sql = format!(
            r#"INSERT INTO "{}" (migration_id, hash, status, script, executed_at) VALUES ($1, $2, $3, $4, $5)"#,
            item_table(item.kind)
        );
        tx.query(
            &sql,
            &[
                migration_id.into(),
                item.fingerprint.as_str().into(),
                item.status.as_str().into(),
                item.script.as_str().into(),
                item.executed_at.into(),
            ],
        )?;
        Ok(())
    }

    /// Id of the migration recorded under `name`.
    pub fn get_id_by_name(&self, tx: &mut Transaction, name: &str) -> Result<String, Error> {
        let result = tx.query(
            r#"SELECT id FROM "migration" WHERE name = $1"#,
            &[name.into()],
        )?;
        result
            .results
            .first()
            .and_then(|row| row.get_str("id"))
            .map(str::to_string)
            .ok_or_else(|| Error::Generic(format!("Migration '{}' is not recorded", name)))
    }

    pub fn find_by_name(
        &self,
        tx: &mut Transaction,
        name: &str,
    ) -> Result<Option<MigrationRecord>, Error> {
        let result = tx.query(&format!("{RECORD_QUERY}\nWHERE m.name = $1"), &[name.into()])?;
        result.results.first().map(parse_record).transpose()
    }

    /// All recorded migrations in execution order.
    pub fn list(&self, tx: &mut Transaction) -> Result<Vec<MigrationRecord>, Error> {
        let result = tx.query(
            &format!("{RECORD_QUERY}\nORDER BY m.execution_order IS NULL, m.execution_order, m.name"),
            &[],
        )?;
        result.results.iter().map(parse_record).collect()
    }

    /// Record the outcome of running a change script.
    ///
    /// Success stamps `executed_at` and re-arms the rollback (status `IGNORED`).
    pub fn update_change_status(
        &self,
        tx: &mut Transaction,
        migration_id: &str,
        success: bool,
    ) -> Result<(), Error> {
        self.update_status(tx, ScriptKind::Change, migration_id, success)?;
        if success {
            self.set_status(tx, ScriptKind::Rollback, migration_id, ItemStatus::Ignored)?;
        }
        Ok(())
    }

    /// Record the outcome of running a rollback script.
    ///
    /// Success stamps `executed_at` and queues the change again (status `QUEUED`).
    pub fn update_rollback_status(
        &self,
        tx: &mut Transaction,
        migration_id: &str,
        success: bool,
    ) -> Result<(), Error> {
        self.update_status(tx, ScriptKind::Rollback, migration_id, success)?;
        if success {
            self.set_status(tx, ScriptKind::Change, migration_id, ItemStatus::Queued)?;
        }
        Ok(())
    }

    fn update_status(
        &self,
        tx: &mut Transaction,
        kind: ScriptKind,
        migration_id: &str,
        success: bool,
    ) -> Result<(), Error> {
        let status = ItemStatus::from_outcome(success);
        if !success {
            return self.set_status(tx, kind, migration_id, status);
        }
        let sql = format!(
            r#"UPDATE "{}" SET status = $1, executed_at = CURRENT_TIMESTAMP WHERE migration_id = $2"#,
            item_table(kind)
        );
        tx.query(&sql, &[status.as_str().into(), migration_id.into()])?;
        Ok(())
    }

    fn set_status(
        &self,
        tx: &mut Transaction,
        kind: ScriptKind,
        migration_id: &str,
        status: ItemStatus,
    ) -> Result<(), Error> {
        let sql = format!(
            r#"UPDATE "{}" SET status = $1 WHERE migration_id = $2"#,
            item_table(kind)
        );
        tx.query(&sql, &[status.as_str().into(), migration_id.into()])?;
        Ok(())
    }

    /// Append one execution attempt to the history.
    pub fn record_history(
        &self,
        tx: &mut Transaction,
        migration_id: &str,
        action: ScriptKind,
        success: bool,
    ) -> Result<(), Error> {
        tx.query(
            r#"INSERT INTO "history" (migration_id, action, status) VALUES ($1, $2, $3)"#,
            &[
                migration_id.into(),
                action.as_str().into(),
                ItemStatus::from_outcome(success).as_str().into(),
            ],
        )?;
        Ok(())
    }

    /// Every recorded execution attempt, oldest first.
    pub fn history(&self, tx: &mut Transaction) -> Result<Vec<HistoryEntry>, Error> {
        let result = tx.query(
            r#"SELECT h.migration_id, m.name, h.action, h.status, h.executed_at
FROM "history" h
JOIN "migration" m ON m.id = h.migration_id
ORDER BY h.id"#,
            &[],
        )?;
        result
            .results
            .iter()
            .map(|row| {
                Ok(HistoryEntry {
                    migration_id: required_str(row, "migration_id")?.to_string(),
                    name: required_str(row, "name")?.to_string(),
                    action: required_str(row, "action")?.parse()?,
                    status: required_str(row, "status")?.parse()?,
                    executed_at: row.get("executed_at").and_then(SqlValue::as_timestamp),
                })
            })
            .collect()
    }
}

fn required_str<'a>(row: &'a Row, column: &str) -> Result<&'a str, Error> {
    row.get_str(column)
        .ok_or_else(|| Error::Generic(format!("Tracking row is missing column '{}'", column)))
}

fn parse_record(row: &Row) -> Result<MigrationRecord, Error> {
    Ok(MigrationRecord {
        id: required_str(row, "id")?.to_string(),
        name: required_str(row, "name")?.to_string(),
        execution_order: row.get_i64("execution_order"),
        on_failure: required_str(row, "on_failure")?.parse()?,
        change: parse_item(row, "change")?,
        rollback: parse_item(row, "rollback")?,
    })
}

fn parse_item(row: &Row, prefix: &str) -> Result<Option<ItemRecord>, Error> {
    let Some(hash) = row.get_str(&format!("{prefix}_hash")) else {
        return Ok(None);
    };
    Ok(Some(ItemRecord {
        hash: hash.to_string(),
        status: required_str(row, &format!("{prefix}_status"))?.parse()?,
        executed_at: row
            .get(&format!("{prefix}_executed_at"))
            .and_then(SqlValue::as_timestamp),
    }))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::core::OnFailure;
    use crate::sqlite::SqliteProvider;
    use std::path::PathBuf;

    fn migration(name: &str, change: &str, rollback: &str) -> Migration {
        let id = uuid::Uuid::new_v4().to_string();
        Migration {
            change: MigrationItem::new(&id, ScriptKind::Change, change.into(), PathBuf::new()),
            rollback: MigrationItem::new(&id, ScriptKind::Rollback, rollback.into(), PathBuf::new()),
            id,
            name: name.into(),
            execution_order: Some(0),
        }
    }

    fn setup() -> (tempfile::TempDir, SqliteProvider) {
        let dir = tempfile::tempdir().unwrap();
        let provider = SqliteProvider::new(dir.path().join("test.db"));
        let mut tx = Transaction::begin(&provider).unwrap();
        MigrationRepository::new().ensure_schema(&mut tx).unwrap();
        tx.commit().unwrap();
        (dir, provider)
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let (_dir, provider) = setup();
        let mut tx = Transaction::begin(&provider).unwrap();
        MigrationRepository::new().ensure_schema(&mut tx).unwrap();
        let tables = tx
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .unwrap();
        tx.commit().unwrap();
        let names: Vec<_> = tables
            .results
            .iter()
            .map(|row| row.get_str("name").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["change", "history", "migration", "rollback"]);
    }

    #[test]
    fn saving_new_migration_records_all_rows() {
        let (_dir, provider) = setup();
        let repo = MigrationRepository::new();
        let m = migration("001-users", "CREATE TABLE users (id INT)", "DROP TABLE users");

        let mut tx = Transaction::begin(&provider).unwrap();
        let id = repo.save_one(&mut tx, &m).unwrap();
        assert_eq!(id, m.id);
        assert_eq!(repo.get_id_by_name(&mut tx, "001-users").unwrap(), m.id);

        let record = repo.find_by_name(&mut tx, "001-users").unwrap().unwrap();
        tx.commit().unwrap();

        assert_eq!(record.on_failure, OnFailure::Fail);
        assert_eq!(record.execution_order, Some(0));
        let change = record.change.unwrap();
        assert_eq!(change.hash, m.change.fingerprint);
        assert_eq!(change.status, ItemStatus::Queued);
        assert_eq!(change.executed_at, None);
        assert_eq!(record.rollback.unwrap().status, ItemStatus::Ignored);
    }

    #[test]
    fn saving_identical_content_twice_is_silent() {
        let (_dir, provider) = setup();
        let repo = MigrationRepository::new();
        let first = migration("X", "CREATE TABLE x (id INT)", "DROP TABLE x");
        let second = migration("X", "CREATE TABLE x (id INT)", "DROP TABLE x");

        let mut tx = Transaction::begin(&provider).unwrap();
        repo.save_one(&mut tx, &first).unwrap();
        let id = repo.save_one(&mut tx, &second).unwrap();
        assert_eq!(id, first.id);
        assert_eq!(repo.list(&mut tx).unwrap().len(), 1);
        tx.commit().unwrap();
    }

    #[test]
    fn changed_content_is_an_integrity_violation() {
        let (_dir, provider) = setup();
        let repo = MigrationRepository::new();

        let mut tx = Transaction::begin(&provider).unwrap();
        repo.save_one(&mut tx, &migration("X", "CREATE TABLE x (id INT)", "DROP TABLE x"))
            .unwrap();

        let error = repo
            .save_one(&mut tx, &migration("X", "CREATE TABLE x (id BIGINT)", "DROP TABLE x"))
            .unwrap_err();
        assert_eq!(
            error,
            Error::IntegrityViolation {
                name: "X".into(),
                kind: ScriptKind::Change
            }
        );

        let error = repo
            .save_one(&mut tx, &migration("X", "CREATE TABLE x (id INT)", "DROP TABLE IF EXISTS x"))
            .unwrap_err();
        assert_eq!(
            error,
            Error::IntegrityViolation {
                name: "X".into(),
                kind: ScriptKind::Rollback
            }
        );
        tx.rollback().unwrap();
    }

    #[test]
    fn missing_item_row_is_inserted_before_comparison() {
        let (_dir, provider) = setup();
        let repo = MigrationRepository::new();
        let m = migration("X", "SELECT 1", "SELECT 2");

        let mut tx = Transaction::begin(&provider).unwrap();
        repo.save_one(&mut tx, &m).unwrap();
        tx.query(r#"DELETE FROM "rollback""#, &[]).unwrap();

        repo.save_one(&mut tx, &migration("X", "SELECT 1", "SELECT 2"))
            .unwrap();
        let record = repo.find_by_name(&mut tx, "X").unwrap().unwrap();
        tx.commit().unwrap();
        assert_eq!(record.rollback.unwrap().hash, m.rollback.fingerprint);
    }

    #[test]
    fn status_updates_reset_the_opposite_item() {
        let (_dir, provider) = setup();
        let repo = MigrationRepository::new();
        let m = migration("X", "SELECT 1", "SELECT 2");

        let mut tx = Transaction::begin(&provider).unwrap();
        repo.save_one(&mut tx, &m).unwrap();

        repo.update_change_status(&mut tx, &m.id, true).unwrap();
        let record = repo.find_by_name(&mut tx, "X").unwrap().unwrap();
        assert!(record.is_applied());
        assert!(record.change.as_ref().unwrap().executed_at.is_some());

        repo.update_rollback_status(&mut tx, &m.id, false).unwrap();
        let record = repo.find_by_name(&mut tx, "X").unwrap().unwrap();
        assert_eq!(record.rollback.as_ref().unwrap().status, ItemStatus::Failure);
        assert!(record.is_applied());

        repo.update_rollback_status(&mut tx, &m.id, true).unwrap();
        let record = repo.find_by_name(&mut tx, "X").unwrap().unwrap();
        assert_eq!(record.rollback.as_ref().unwrap().status, ItemStatus::Success);
        assert_eq!(record.change.as_ref().unwrap().status, ItemStatus::Queued);

        repo.update_change_status(&mut tx, &m.id, false).unwrap();
        let record = repo.find_by_name(&mut tx, "X").unwrap().unwrap();
        assert_eq!(record.change.as_ref().unwrap().status, ItemStatus::Failure);
        assert_eq!(record.rollback.as_ref().unwrap().status, ItemStatus::Success);
        tx.commit().unwrap();
    }

    #[test]
    fn history_lists_attempts_in_order() {
        let (_dir, provider) = setup();
        let repo = MigrationRepository::new();
        let m = migration("X", "SELECT 1", "SELECT 2");

        let mut tx = Transaction::begin(&provider).unwrap();
        repo.save_one(&mut tx, &m).unwrap();
        repo.record_history(&mut tx, &m.id, ScriptKind::Change, false)
            .unwrap();
        repo.record_history(&mut tx, &m.id, ScriptKind::Change, true)
            .unwrap();
        repo.record_history(&mut tx, &m.id, ScriptKind::Rollback, true)
            .unwrap();
        let history = repo.history(&mut tx).unwrap();
        tx.commit().unwrap();

        let summary: Vec<_> = history
            .iter()
            .map(|entry| (entry.action, entry.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ScriptKind::Change, ItemStatus::Failure),
                (ScriptKind::Change, ItemStatus::Success),
                (ScriptKind::Rollback, ItemStatus::Success),
            ]
        );
        assert!(history.iter().all(|entry| entry.name == "X"));
        assert!(history.iter().all(|entry| entry.executed_at.is_some()));
    }

    #[test]
    fn unknown_name_has_no_id() {
        let (_dir, provider) = setup();
        let mut tx = Transaction::begin(&provider).unwrap();
        assert!(MigrationRepository::new()
            .get_id_by_name(&mut tx, "nope")
            .is_err());
        assert_eq!(
            MigrationRepository::new()
                .find_by_name(&mut tx, "nope")
                .unwrap(),
            None
        );
        tx.rollback().unwrap();
    }
}
