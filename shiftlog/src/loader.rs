//! Reads migrations from the directory convention
//! `{root}/{name}/change.sql` and `{root}/{name}/rollback.sql`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::core::{Migration, MigrationItem, ScriptKind};
use crate::error::Error;

pub struct MigrationLoader;

impl MigrationLoader {
    /// Load every migration directory directly under `root`, sorted by name.
    ///
    /// Plain files and hidden directories are ignored. Each migration gets its
    /// position in the sorted listing as `execution_order`. A migration with a
    /// missing script fails the whole load.
    pub fn load_all(root: impl AsRef<Path>) -> Result<Vec<Migration>, Error> {
        let root = root.as_ref();
        let io_error = |source| Error::Io {
            path: root.to_path_buf(),
            source,
        };

        let mut directories = Vec::new();
        for entry in fs::read_dir(root).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            let is_hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type().map_err(io_error)?.is_dir() && !is_hidden {
                directories.push(entry.path());
            }
        }
        directories.sort();

        tracing::debug!(
            root = %root.display(),
            count = directories.len(),
            "Found migration directories"
        );

        directories
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let mut migration = Self::load_one(path)?;
                migration.execution_order = Some(index as i64);
                Ok(migration)
            })
            .collect()
    }

    /// Load the migration stored in the directory `path`.
    ///
    /// The migration is named after the directory and gets a freshly generated id.
    pub fn load_one(path: impl AsRef<Path>) -> Result<Migration, Error> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Generic(format!("Invalid migration path {}", path.display())))?;
        let id = Uuid::new_v4().to_string();

        let change = read_item(&id, &name, path, ScriptKind::Change)?;
        let rollback = read_item(&id, &name, path, ScriptKind::Rollback)?;

        Ok(Migration {
            id,
            name,
            execution_order: None,
            change,
            rollback,
        })
    }
}

fn read_item(id: &str, name: &str, dir: &Path, kind: ScriptKind) -> Result<MigrationItem, Error> {
    let path: PathBuf = dir.join(kind.file_name());
    let script = fs::read_to_string(&path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => Error::MissingScript {
            migration: name.to_string(),
            path: path.clone(),
        },
        _ => Error::Io {
            path: path.clone(),
            source,
        },
    })?;
    Ok(MigrationItem::new(id, kind, script, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemStatus;

    fn write_migration(root: &Path, name: &str, change: &str, rollback: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("change.sql"), change).unwrap();
        fs::write(dir.join("rollback.sql"), rollback).unwrap();
    }

    #[test]
    fn loads_directories_in_sorted_order() {
        let root = tempfile::tempdir().unwrap();
        write_migration(root.path(), "002-posts", "CREATE TABLE posts (id INT)", "DROP TABLE posts");
        write_migration(root.path(), "001-users", "CREATE TABLE users (id INT)", "DROP TABLE users");
        fs::write(root.path().join("README.md"), "not a migration").unwrap();
        fs::create_dir(root.path().join(".git")).unwrap();

        let migrations = MigrationLoader::load_all(root.path()).unwrap();
        let names: Vec<_> = migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["001-users", "002-posts"]);
        assert_eq!(migrations[0].execution_order, Some(0));
        assert_eq!(migrations[1].execution_order, Some(1));

        let users = &migrations[0];
        assert_eq!(users.change.script, "CREATE TABLE users (id INT)");
        assert_eq!(users.change.status, ItemStatus::Queued);
        assert_eq!(users.rollback.status, ItemStatus::Ignored);
        assert_eq!(users.change.migration_id, users.id);
        assert_eq!(users.rollback.migration_id, users.id);
        assert_ne!(migrations[0].id, migrations[1].id);
    }

    #[test]
    fn loading_twice_gives_identical_fingerprints_and_fresh_ids() {
        let root = tempfile::tempdir().unwrap();
        write_migration(root.path(), "001-users", "CREATE TABLE users (id INT);\n", "DROP TABLE users;\n");

        let first = MigrationLoader::load_all(root.path()).unwrap();
        let second = MigrationLoader::load_all(root.path()).unwrap();
        assert_eq!(first[0].change.fingerprint, second[0].change.fingerprint);
        assert_eq!(first[0].rollback.fingerprint, second[0].rollback.fingerprint);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn missing_script_fails_the_whole_load() {
        let root = tempfile::tempdir().unwrap();
        write_migration(root.path(), "001-users", "SELECT 1", "SELECT 1");
        let broken = root.path().join("002-broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join("change.sql"), "SELECT 1").unwrap();

        let error = MigrationLoader::load_all(root.path()).unwrap_err();
        assert_eq!(
            error,
            Error::MissingScript {
                migration: "002-broken".into(),
                path: broken.join("rollback.sql"),
            }
        );
    }

    #[test]
    fn load_one_has_no_execution_order() {
        let root = tempfile::tempdir().unwrap();
        write_migration(root.path(), "001-users", "SELECT 1", "SELECT 2");

        let migration = MigrationLoader::load_one(root.path().join("001-users")).unwrap();
        assert_eq!(migration.name, "001-users");
        assert_eq!(migration.execution_order, None);
        assert_eq!(migration.rollback.script, "SELECT 2");
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        let error = MigrationLoader::load_all(&missing).unwrap_err();
        assert!(matches!(error, Error::Io { path, .. } if path == missing));
    }
}
