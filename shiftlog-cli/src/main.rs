//! Command-line runner for shiftlog migrations.
//!
//! Settings come from flags, the environment (`DATABASE_URL`) and an optional
//! `shiftlog.toml`, in that order of precedence.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use shiftlog::{
    ConnectionProvider, MigrationConfig, MigrationLoader, MigrationRecord,
    MigrationService, PersistenceService, QueryConfig, RunReport,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_SETTINGS_FILE: &str = "shiftlog.toml";

#[derive(Parser)]
#[command(name = "shiftlog", version, about = "Database migration tool")]
struct CliArgs {
    /// Database to migrate: a SQLite file path or a postgres:// URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,
    /// Directory holding one subdirectory per migration
    #[arg(long, global = true)]
    migrations_root: Option<PathBuf>,
    /// Settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    /// Log at debug level, overriding RUST_LOG
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply every pending migration (requires database)
    Setup,
    /// Roll back every applied migration, last first (requires database)
    Clear,
    /// Run the change script of one migration directory (requires database)
    Change { path: PathBuf },
    /// Run the rollback script of one migration directory (requires database)
    Rollback { path: PathBuf },
    /// Show recorded migrations and their status (requires database)
    Status,
    /// List migrations that are not applied yet (requires database)
    Pending,
    /// Show every recorded execution attempt (requires database)
    History,
    /// List migrations found on disk (no database required)
    List,
    /// Execute SQL statements in one transaction (requires database)
    Exec { sql: String },
}

/// Contents of `shiftlog.toml`.
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Settings {
    database_url: Option<String>,
    migrations_root: Option<PathBuf>,
    query: QueryConfig,
}

impl Settings {
    /// Read settings from `path`. A missing default settings file is not an error.
    fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_SETTINGS_FILE), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Could not read {}: {}", path.display(), e))?;
        toml::from_str(&text).map_err(|e| format!("Invalid {}: {}", path.display(), e).into())
    }

    /// Apply command-line values over the file's.
    fn merge(mut self, args: &CliArgs) -> Self {
        if let Some(url) = &args.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(root) = &args.migrations_root {
            self.migrations_root = Some(root.clone());
        }
        self
    }

    fn migration_config(&self) -> MigrationConfig {
        match &self.migrations_root {
            Some(root) => MigrationConfig {
                migrations_root: root.clone(),
            },
            None => MigrationConfig::default(),
        }
    }

    fn provider(&self) -> Result<Box<dyn ConnectionProvider>, Box<dyn std::error::Error>> {
        let url = self
            .database_url
            .as_deref()
            .ok_or("No database configured. Set DATABASE_URL or pass --database-url.")?;
        provider_for(url)
    }
}

fn provider_for(url: &str) -> Result<Box<dyn ConnectionProvider>, Box<dyn std::error::Error>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return postgres_provider(url);
    }
    sqlite_provider(url.strip_prefix("sqlite://").unwrap_or(url))
}

#[cfg(feature = "postgres")]
fn postgres_provider(url: &str) -> Result<Box<dyn ConnectionProvider>, Box<dyn std::error::Error>> {
    Ok(Box::new(shiftlog::postgres::PostgresProvider::new(url)))
}

#[cfg(not(feature = "postgres"))]
fn postgres_provider(_url: &str) -> Result<Box<dyn ConnectionProvider>, Box<dyn std::error::Error>> {
    Err("PostgreSQL support is not enabled in this build".into())
}

#[cfg(feature = "sqlite")]
fn sqlite_provider(path: &str) -> Result<Box<dyn ConnectionProvider>, Box<dyn std::error::Error>> {
    Ok(Box::new(shiftlog::sqlite::SqliteProvider::new(path)))
}

#[cfg(not(feature = "sqlite"))]
fn sqlite_provider(path: &str) -> Result<Box<dyn ConnectionProvider>, Box<dyn std::error::Error>> {
    Err(format!("SQLite support is not enabled in this build, cannot open '{}'", path).into())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Parse args first - this allows --help to work without a database
    let args = CliArgs::parse();
    init_tracing(args.debug);

    let settings = Settings::load(args.config.as_deref())?.merge(&args);
    let config = settings.migration_config();
    tracing::debug!(
        migrations_root = %config.migrations_root.display(),
        max_statements = settings.query.max_statements,
        "Settings loaded"
    );

    // Handle commands that don't need a database connection
    if let Commands::List = &args.command {
        let migrations = MigrationLoader::load_all(&config.migrations_root)?;
        let names: Vec<_> = migrations.iter().map(|m| m.name.as_str()).collect();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&names)?);
        } else if names.is_empty() {
            println!("No migrations found in {}.", config.migrations_root.display());
        } else {
            println!("Migrations ({}):", names.len());
            for name in names {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    let provider = settings.provider()?;

    if let Commands::Exec { sql } = &args.command {
        let persistence = PersistenceService::new(&provider, settings.query);
        let result = persistence.execute(sql, &[])?;
        println!(
            "inserted: {}, updated: {}, deleted: {}, rows: {}",
            result.inserted,
            result.updated,
            result.deleted,
            result.results.len()
        );
        return Ok(());
    }

    let service = MigrationService::new(provider, config);
    match &args.command {
        Commands::Setup => finish(service.setup()?, args.json),
        Commands::Clear => finish(service.clear()?, args.json),
        Commands::Change { path } => {
            service.execute_change(path)?;
            println!("Applied {}", path.display());
            Ok(())
        }
        Commands::Rollback { path } => {
            service.execute_rollback(path)?;
            println!("Rolled back {}", path.display());
            Ok(())
        }
        Commands::Status => {
            let records: Vec<_> = service.status()?.iter().map(StatusLine::from).collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No migrations recorded.");
            } else {
                for line in records {
                    println!(
                        "{:<40} change: {:<8} rollback: {:<8} {}",
                        line.name,
                        line.change,
                        line.rollback,
                        line.executed_at.unwrap_or_default()
                    );
                }
            }
            Ok(())
        }
        Commands::Pending => {
            let names: Vec<_> = service.pending()?.into_iter().map(|m| m.name).collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("Database is up to date.");
            } else {
                println!("Pending migrations ({}):", names.len());
                for name in names {
                    println!("  {}", name);
                }
            }
            Ok(())
        }
        Commands::History => {
            let entries: Vec<_> = service
                .history()?
                .into_iter()
                .map(|entry| HistoryLine {
                    name: entry.name,
                    action: entry.action.as_str(),
                    status: entry.status.as_str(),
                    executed_at: entry.executed_at.map(|ts| ts.to_string()),
                })
                .collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{}  {:<8} {:<8} {}",
                        entry.executed_at.unwrap_or_default(),
                        entry.action,
                        entry.status,
                        entry.name
                    );
                }
            }
            Ok(())
        }
        Commands::List | Commands::Exec { .. } => Ok(()),
    }
}

#[derive(Debug, Serialize)]
struct StatusLine {
    name: String,
    execution_order: Option<i64>,
    change: &'static str,
    rollback: &'static str,
    executed_at: Option<String>,
}

impl From<&MigrationRecord> for StatusLine {
    fn from(record: &MigrationRecord) -> Self {
        let status = |item: &Option<shiftlog::ItemRecord>| {
            item.as_ref().map_or("-", |item| item.status.as_str())
        };
        Self {
            name: record.name.clone(),
            execution_order: record.execution_order,
            change: status(&record.change),
            rollback: status(&record.rollback),
            executed_at: record
                .change
                .as_ref()
                .and_then(|change| change.executed_at)
                .map(|ts| ts.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct HistoryLine {
    name: String,
    action: &'static str,
    status: &'static str,
    executed_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReportSummary<'a> {
    applied: &'a [String],
    skipped: &'a [String],
    failed: Option<&'a str>,
    error: Option<String>,
}

/// Print a run report; a failed run becomes the command's error.
fn finish(report: RunReport, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        let summary = ReportSummary {
            applied: &report.applied,
            skipped: &report.skipped,
            failed: report.failure.as_ref().map(|f| f.name.as_str()),
            error: report.failure.as_ref().map(|f| f.error.to_string()),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for name in &report.applied {
            println!("  applied  {}", name);
        }
        for name in &report.skipped {
            println!("  skipped  {}", name);
        }
        if let Some(failure) = &report.failure {
            println!("  {:<8} {}", failure.state.to_string(), failure.name);
        }
    }

    match report.into_result() {
        Ok(_) => Ok(()),
        Err(error) => Err(Box::new(error) as Box<dyn std::error::Error>),
    }
}
