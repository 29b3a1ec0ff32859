use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionProvider;
use crate::core::{
    HistoryEntry, Migration, MigrationRecord, MigrationState, RunFailure, RunReport, ScriptKind,
};
use crate::error::Error;
use crate::loader::MigrationLoader;
use crate::persistence::{PersistenceService, QueryConfig};
use crate::repository::MigrationRepository;
use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory holding one subdirectory per migration.
    pub migrations_root: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_root: PathBuf::from("./migrations"),
        }
    }
}

/// Runs change and rollback scripts and keeps the tracking tables up to date.
///
/// Every script runs in its own transaction together with its status update
/// and history entry. Runs stop at the first failure; earlier migrations of the
/// same run stay applied, and a failed change never triggers its own rollback
/// script.
pub struct MigrationService<P> {
    persistence: PersistenceService<P>,
    repository: MigrationRepository,
    config: MigrationConfig,
}

impl<P: ConnectionProvider> MigrationService<P> {
    pub fn new(provider: P, config: MigrationConfig) -> Self {
        Self {
            persistence: PersistenceService::new(provider, QueryConfig::default()),
            repository: MigrationRepository::new(),
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        self.persistence.provider()
    }

    /// Create the tracking tables if they do not exist.
    pub fn bootstrap(&self) -> Result<(), Error> {
        self.persistence
            .transact(true, |tx| self.repository.ensure_schema(tx))
    }

    /// Apply every migration under the configured root that is not applied yet.
    pub fn setup(&self) -> Result<RunReport, Error> {
        let migrations = MigrationLoader::load_all(&self.config.migrations_root)?;
        self.execute_sequential_changes(&migrations)
    }

    /// Roll back every applied migration under the configured root, last first.
    pub fn clear(&self) -> Result<RunReport, Error> {
        let mut migrations = MigrationLoader::load_all(&self.config.migrations_root)?;
        migrations.reverse();
        self.execute_sequential_rollbacks(&migrations)
    }

    /// Run the change script of the migration in `path`, whatever its status.
    pub fn execute_change(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.execute_single(path.as_ref(), ScriptKind::Change)
    }

    /// Run the rollback script of the migration in `path`, whatever its status.
    pub fn execute_rollback(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.execute_single(path.as_ref(), ScriptKind::Rollback)
    }

    fn execute_single(&self, path: &Path, kind: ScriptKind) -> Result<(), Error> {
        let migration = MigrationLoader::load_one(path)?;
        let records = self.record(std::slice::from_ref(&migration))?;
        let id = records
            .first()
            .map(|record| record.id.clone())
            .unwrap_or_else(|| migration.id.clone());
        self.run_script(&migration, &id, kind)
            .map_err(|(_, error)| error)
    }

    /// Apply the change scripts of `migrations` in order.
    ///
    /// All metadata is recorded (and verified) before anything runs, so an
    /// integrity violation aborts the run with nothing executed. Migrations
    /// already applied are skipped.
    pub fn execute_sequential_changes(&self, migrations: &[Migration]) -> Result<RunReport, Error> {
        self.execute_sequential(migrations, ScriptKind::Change)
    }

    /// Run the rollback scripts of `migrations` in the order given.
    ///
    /// Only migrations whose change is applied are rolled back.
    pub fn execute_sequential_rollbacks(
        &self,
        migrations: &[Migration],
    ) -> Result<RunReport, Error> {
        self.execute_sequential(migrations, ScriptKind::Rollback)
    }

    fn execute_sequential(
        &self,
        migrations: &[Migration],
        kind: ScriptKind,
    ) -> Result<RunReport, Error> {
        let records = self.record(migrations)?;

        let mut report = RunReport::default();
        for (migration, record) in migrations.iter().zip(&records) {
            let needed = match kind {
                ScriptKind::Change => !record.is_applied(),
                ScriptKind::Rollback => record.is_applied(),
            };
            if !needed {
                tracing::debug!(name = %migration.name, %kind, "Skipping migration, nothing to do");
                report.skipped.push(migration.name.clone());
                continue;
            }

            match self.run_script(migration, &record.id, kind) {
                Ok(()) => report.applied.push(migration.name.clone()),
                Err((state, error)) => {
                    report.failure = Some(RunFailure {
                        name: migration.name.clone(),
                        kind,
                        state,
                        error,
                    });
                    break;
                }
            }
        }

        tracing::info!(
            %kind,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            failed = report.failure.is_some(),
            "Migration run finished"
        );
        Ok(report)
    }

    /// Record `migrations` and return their stored state, in the same order.
    fn record(&self, migrations: &[Migration]) -> Result<Vec<MigrationRecord>, Error> {
        self.persistence.transact(true, |tx| {
            self.repository.ensure_schema(tx)?;
            self.repository.save_all(tx, migrations)?;
            migrations
                .iter()
                .map(|migration| {
                    self.repository
                        .find_by_name(tx, &migration.name)?
                        .ok_or_else(|| {
                            Error::Generic(format!(
                                "Migration '{}' missing after being recorded",
                                migration.name
                            ))
                        })
                })
                .collect()
        })
    }

    /// Run one script in its own transaction together with its bookkeeping.
    ///
    /// On failure the transaction is rolled back first and the failure status
    /// is then written in a new transaction, so that it survives the rollback.
    fn run_script(
        &self,
        migration: &Migration,
        id: &str,
        kind: ScriptKind,
    ) -> Result<(), (MigrationState, Error)> {
        let _span = tracing::info_span!("migration", name = %migration.name, %kind).entered();
        tracing::info!(state = %MigrationState::Applying, "Starting migration");

        let mut tx = match Transaction::begin(self.provider()) {
            Ok(tx) => tx,
            Err(error) => {
                tracing::error!(error = %error, "Could not open a transaction for migration");
                return Err((MigrationState::Pending, error));
            }
        };

        let error = match self.apply(&mut tx, migration, id, kind) {
            Ok(()) => {
                tracing::info!(state = %MigrationState::Applied, "Migration completed successfully");
                return Ok(());
            }
            Err(error) => error,
        };

        tracing::error!(error = %error, "Migration failed");
        let state = match tx.close_if_open(false) {
            Ok(()) => MigrationState::RolledBack,
            Err(rollback_error) => {
                tracing::warn!(error = %rollback_error, "Rolling back failed migration failed too");
                MigrationState::Failed
            }
        };

        let recorded = self.persistence.transact(true, |tx| {
            self.update_status(tx, id, kind, false)?;
            self.repository.record_history(tx, id, kind, false)
        });
        if let Err(record_error) = recorded {
            tracing::warn!(error = %record_error, "Could not record migration failure");
        }

        tracing::debug!(%state, "Migration unwound");
        Err((state, error))
    }

    fn apply(
        &self,
        tx: &mut Transaction,
        migration: &Migration,
        id: &str,
        kind: ScriptKind,
    ) -> Result<(), Error> {
        let result = tx.query(&migration.item(kind).script, &[])?;
        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Script executed"
        );
        self.update_status(tx, id, kind, true)?;
        self.repository.record_history(tx, id, kind, true)?;
        tx.commit()
    }

    fn update_status(
        &self,
        tx: &mut Transaction,
        id: &str,
        kind: ScriptKind,
        success: bool,
    ) -> Result<(), Error> {
        match kind {
            ScriptKind::Change => self.repository.update_change_status(tx, id, success),
            ScriptKind::Rollback => self.repository.update_rollback_status(tx, id, success),
        }
    }

    /// Stored state of every recorded migration, in execution order.
    pub fn status(&self) -> Result<Vec<MigrationRecord>, Error> {
        self.persistence.transact(true, |tx| {
            self.repository.ensure_schema(tx)?;
            self.repository.list(tx)
        })
    }

    /// Migrations under the configured root whose change is not applied.
    pub fn pending(&self) -> Result<Vec<Migration>, Error> {
        let migrations = MigrationLoader::load_all(&self.config.migrations_root)?;
        let records = self.status()?;
        Ok(migrations
            .into_iter()
            .filter(|migration| {
                !records
                    .iter()
                    .any(|record| record.name == migration.name && record.is_applied())
            })
            .collect())
    }

    /// Every recorded execution attempt, oldest first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, Error> {
        self.persistence.transact(true, |tx| {
            self.repository.ensure_schema(tx)?;
            self.repository.history(tx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemStatus;
    use crate::testing::mock::MockProvider;
    use crate::value::SqlValue;

    #[test]
    fn default_root() {
        assert_eq!(
            MigrationConfig::default().migrations_root,
            PathBuf::from("./migrations")
        );
    }

    #[test]
    fn unreadable_root_fails_before_connecting() {
        let provider = MockProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let service = MigrationService::new(
            provider.clone(),
            MigrationConfig {
                migrations_root: dir.path().join("missing"),
            },
        );
        assert!(matches!(service.setup().unwrap_err(), Error::Io { .. }));
        assert_eq!(provider.connects(), 0);
    }

    #[test]
    fn every_connection_is_released_when_the_database_rejects_everything() {
        let provider = MockProvider::new();
        provider.fail_on("CREATE TABLE", "permission denied for schema public");
        let dir = tempfile::tempdir().unwrap();
        let migration = dir.path().join("001-users");
        std::fs::create_dir(&migration).unwrap();
        std::fs::write(migration.join("change.sql"), "SELECT 1").unwrap();
        std::fs::write(migration.join("rollback.sql"), "SELECT 2").unwrap();

        let service = MigrationService::new(
            provider.clone(),
            MigrationConfig {
                migrations_root: dir.path().to_path_buf(),
            },
        );
        let error = service.setup().unwrap_err();
        assert_eq!(
            error,
            Error::Generic("permission denied for schema public".into())
        );
        assert_eq!(provider.connects(), provider.releases());
    }

    /// A migration root holding one migration, with `provider` answering the
    /// tracking queries as if it had been recorded before and never applied.
    fn recorded_migration(provider: &MockProvider, change: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let migration = dir.path().join("001-audit");
        std::fs::create_dir(&migration).unwrap();
        std::fs::write(migration.join("change.sql"), change).unwrap();
        std::fs::write(migration.join("rollback.sql"), "DELETE FROM audit").unwrap();

        provider.return_rows(
            r#"LEFT JOIN "change""#,
            &[
                "id",
                "name",
                "execution_order",
                "on_failure",
                "change_hash",
                "change_status",
                "change_executed_at",
                "rollback_hash",
                "rollback_status",
                "rollback_executed_at",
            ],
            vec![vec![
                "m-1".into(),
                "001-audit".into(),
                SqlValue::Int(0),
                "FAIL".into(),
                crate::core::fingerprint(change).into(),
                "QUEUED".into(),
                SqlValue::Null,
                crate::core::fingerprint("DELETE FROM audit").into(),
                "IGNORED".into(),
                SqlValue::Null,
            ]],
        );
        dir
    }

    #[test]
    fn failing_rollback_of_a_failed_script_leaves_it_failed() {
        let provider = MockProvider::new();
        let dir = recorded_migration(&provider, "INSERT INTO audit VALUES (1)");
        provider.fail_on("INSERT INTO audit", "relation \"audit\" does not exist");
        provider.fail_on_statement("ROLLBACK", "connection reset during rollback");

        let service = MigrationService::new(
            provider.clone(),
            MigrationConfig {
                migrations_root: dir.path().to_path_buf(),
            },
        );
        let report = service.setup().unwrap();

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.name, "001-audit");
        assert_eq!(failure.state, MigrationState::Failed);
        // the script's error is reported, not the rollback's
        assert_eq!(
            failure.error,
            Error::Generic("relation \"audit\" does not exist".into())
        );
        assert!(report.applied.is_empty());

        // the FAILURE status and history row are still written afterwards
        let executed = provider.executed();
        let params = provider.params();
        let failed_rollback = executed.iter().position(|sql| sql == "ROLLBACK").unwrap();
        let status_update = executed
            .iter()
            .enumerate()
            .skip(failed_rollback)
            .find(|(_, sql)| sql.starts_with(r#"UPDATE "change" SET status"#))
            .map(|(index, _)| index)
            .unwrap();
        assert_eq!(params[status_update][0], SqlValue::from("FAILURE"));
        assert!(executed[status_update..]
            .iter()
            .any(|sql| sql.starts_with(r#"INSERT INTO "history""#)));
        assert_eq!(executed.last().map(String::as_str), Some("COMMIT"));

        assert_eq!(provider.connects(), provider.releases());
    }

    #[test]
    fn script_that_cannot_get_a_connection_stays_pending() {
        let provider = MockProvider::new();
        let dir = recorded_migration(&provider, "INSERT INTO audit VALUES (1)");
        // recording the metadata gets a connection; running the script does not
        provider.fail_connect_after(1, "too many clients already");

        let service = MigrationService::new(
            provider.clone(),
            MigrationConfig {
                migrations_root: dir.path().to_path_buf(),
            },
        );
        let report = service.setup().unwrap();

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.state, MigrationState::Pending);
        assert_eq!(
            failure.error,
            Error::Connection("too many clients already".into())
        );
        assert!(!provider
            .executed()
            .iter()
            .any(|sql| sql.contains("INSERT INTO audit")));
        assert_eq!(provider.connects(), 1);
        assert_eq!(provider.releases(), 1);
    }

    #[cfg(feature = "sqlite")]
    mod sqlite {
        use super::*;
        use crate::testing::sqlite::SqliteTestHarness;

        #[test]
        fn failing_change_stops_the_run() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration(
                    "001-a",
                    "CREATE TABLE a (id INTEGER NOT NULL);\nINSERT INTO a (id) VALUES (1);",
                    "DROP TABLE a;",
                )
                .unwrap();
            harness
                .add_migration(
                    "002-b",
                    "CREATE TABLE b (id INTEGER NOT NULL);\nINSERT INTO b (id) VALUES (NULL);",
                    "DROP TABLE b;",
                )
                .unwrap();
            harness
                .add_migration("003-c", "CREATE TABLE c (id INTEGER);", "DROP TABLE c;")
                .unwrap();

            let report = harness.service().setup().unwrap();
            assert_eq!(report.applied, vec!["001-a"]);
            let failure = report.failure.as_ref().unwrap();
            assert_eq!(failure.name, "002-b");
            assert_eq!(failure.kind, ScriptKind::Change);
            assert_eq!(failure.state, MigrationState::RolledBack);
            assert!(failure.error.is_script_execution());
            assert!(failure.error.to_string().contains("NOT NULL"));

            // A is committed, B's CREATE TABLE was rolled back, C never ran
            harness.assert_table_exists("a").unwrap();
            harness.assert_table_not_exists("b").unwrap();
            harness.assert_table_not_exists("c").unwrap();
            assert_eq!(harness.query_all("SELECT id FROM a").unwrap().len(), 1);

            let status = harness.service().status().unwrap();
            let change_status = |name: &str| {
                status
                    .iter()
                    .find(|record| record.name == name)
                    .and_then(|record| record.change.as_ref())
                    .map(|change| change.status)
            };
            assert_eq!(change_status("001-a"), Some(ItemStatus::Success));
            assert_eq!(change_status("002-b"), Some(ItemStatus::Failure));
            assert_eq!(change_status("003-c"), Some(ItemStatus::Queued));

            let history = harness.service().history().unwrap();
            let attempts: Vec<_> = history
                .iter()
                .map(|entry| (entry.name.as_str(), entry.status))
                .collect();
            assert_eq!(
                attempts,
                vec![
                    ("001-a", ItemStatus::Success),
                    ("002-b", ItemStatus::Failure)
                ]
            );
        }

        #[test]
        fn clear_rolls_back_in_reverse_order() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration(
                    "001-a",
                    "CREATE TABLE a (id INTEGER);",
                    "DROP TABLE a;",
                )
                .unwrap();
            // B's rollback depends on A still existing
            harness
                .add_migration(
                    "002-b",
                    "CREATE TABLE b (id INTEGER);",
                    "INSERT INTO a (id) VALUES (2);\nDROP TABLE b;",
                )
                .unwrap();
            let service = harness.service();
            assert!(service.setup().unwrap().is_success());

            let report = service.clear().unwrap();
            assert!(report.is_success());
            assert_eq!(report.applied, vec!["002-b", "001-a"]);
            harness.assert_table_not_exists("a").unwrap();
            harness.assert_table_not_exists("b").unwrap();

            let rollbacks: Vec<_> = service
                .history()
                .unwrap()
                .into_iter()
                .filter(|entry| entry.action == ScriptKind::Rollback)
                .map(|entry| entry.name)
                .collect();
            assert_eq!(rollbacks, vec!["002-b", "001-a"]);
        }

        #[test]
        fn failing_rollback_stops_the_clear() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration("001-a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;")
                .unwrap();
            harness
                .add_migration(
                    "002-b",
                    "CREATE TABLE b (id INTEGER);",
                    "DROP TABLE b;\nINSERT INTO missing (id) VALUES (1);",
                )
                .unwrap();
            let service = harness.service();
            assert!(service.setup().unwrap().is_success());

            let report = service.clear().unwrap();
            assert!(report.applied.is_empty());
            let failure = report.failure.as_ref().unwrap();
            assert_eq!(failure.name, "002-b");
            assert_eq!(failure.kind, ScriptKind::Rollback);
            assert_eq!(failure.state, MigrationState::RolledBack);
            assert!(failure.error.is_script_execution());

            // B's DROP was rolled back and A was never touched
            harness.assert_table_exists("a").unwrap();
            harness.assert_table_exists("b").unwrap();

            let status = service.status().unwrap();
            let statuses = |name: &str| {
                let record = status.iter().find(|record| record.name == name).unwrap();
                (
                    record.change.as_ref().unwrap().status,
                    record.rollback.as_ref().unwrap().status,
                )
            };
            assert_eq!(statuses("001-a"), (ItemStatus::Success, ItemStatus::Ignored));
            assert_eq!(statuses("002-b"), (ItemStatus::Success, ItemStatus::Failure));

            let rollbacks: Vec<_> = service
                .history()
                .unwrap()
                .into_iter()
                .filter(|entry| entry.action == ScriptKind::Rollback)
                .map(|entry| (entry.name, entry.status))
                .collect();
            assert_eq!(rollbacks, vec![("002-b".to_string(), ItemStatus::Failure)]);
        }

        #[test]
        fn reruns_are_idempotent() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration("001-a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;")
                .unwrap();
            let service = harness.service();

            assert_eq!(service.setup().unwrap().applied, vec!["001-a"]);
            let second = service.setup().unwrap();
            assert!(second.applied.is_empty());
            assert_eq!(second.skipped, vec!["001-a"]);

            assert_eq!(service.clear().unwrap().applied, vec!["001-a"]);
            assert_eq!(service.clear().unwrap().skipped, vec!["001-a"]);

            // a rolled back migration can be applied again
            assert_eq!(service.setup().unwrap().applied, vec!["001-a"]);
            harness.assert_table_exists("a").unwrap();
            assert!(service.pending().unwrap().is_empty());
        }

        #[test]
        fn edited_script_aborts_before_anything_runs() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration("001-a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;")
                .unwrap();
            let service = harness.service();
            service.setup().unwrap();

            harness
                .add_migration("002-b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;")
                .unwrap();
            harness
                .write_script("001-a", ScriptKind::Change, "CREATE TABLE a (id BIGINT);")
                .unwrap();

            let error = service.setup().unwrap_err();
            assert_eq!(
                error,
                Error::IntegrityViolation {
                    name: "001-a".into(),
                    kind: ScriptKind::Change
                }
            );
            harness.assert_table_not_exists("b").unwrap();
        }

        #[test]
        fn single_change_and_rollback() {
            let harness = SqliteTestHarness::new().unwrap();
            let path = harness
                .add_migration("001-a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;")
                .unwrap();
            let service = harness.service();

            service.execute_change(&path).unwrap();
            harness.assert_table_exists("a").unwrap();
            assert_eq!(service.status().unwrap().len(), 1);
            assert!(service.status().unwrap()[0].is_applied());

            // running it again is the operator's call; the database rejects it
            let error = service.execute_change(&path).unwrap_err();
            assert!(error.is_script_execution());
            let record = &service.status().unwrap()[0];
            assert_eq!(record.change.as_ref().unwrap().status, ItemStatus::Failure);

            service.execute_rollback(&path).unwrap();
            harness.assert_table_not_exists("a").unwrap();
            let record = &service.status().unwrap()[0];
            assert_eq!(record.rollback.as_ref().unwrap().status, ItemStatus::Success);
            assert_eq!(record.change.as_ref().unwrap().status, ItemStatus::Queued);
        }

        #[test]
        #[tracing_test::traced_test]
        fn runs_are_logged() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration("001-a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;")
                .unwrap();
            harness
                .add_migration("002-b", "INSERT INTO missing VALUES (1);", "SELECT 1;")
                .unwrap();

            harness.service().setup().unwrap();

            assert!(logs_contain("Starting migration"));
            assert!(logs_contain("Migration completed successfully"));
            assert!(logs_contain("Migration failed"));
            assert!(logs_contain("no such table: missing"));
            assert!(logs_contain("Migration run finished"));
        }

        #[test]
        fn pending_lists_unapplied_migrations() {
            let harness = SqliteTestHarness::new().unwrap();
            harness
                .add_migration("001-a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;")
                .unwrap();
            let service = harness.service();
            let pending: Vec<_> = service.pending().unwrap().into_iter().map(|m| m.name).collect();
            assert_eq!(pending, vec!["001-a"]);

            service.setup().unwrap();
            harness
                .add_migration("002-b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;")
                .unwrap();
            let pending: Vec<_> = service.pending().unwrap().into_iter().map(|m| m.name).collect();
            assert_eq!(pending, vec!["002-b"]);
        }
    }
}
