//! Connections, schema bootstrap, and migrations for the task store.
//!
//! Every graft process (orchestrator, executor pool, evaluator) opens its
//! own pool against the same database; the store is the single shared
//! mutable resource, so pool sizing travels with [`DbConfig`] per process
//! rather than as a global.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Tables owned by the graft schema: the workflow model first, then the
/// fabric. [`schema_counts`] reports them in this order.
const SCHEMA_TABLES: &[&str] = &[
    "workflows",
    "tasks",
    "task_dependencies",
    "experiences",
    "fabric_bindings",
    "fabric_messages",
    "fabric_dead_letters",
];

/// Connection settings for the task store.
///
/// The URL comes from `GRAFT_DATABASE_URL` (or an explicit value); the
/// pool size defaults low and is raised by callers that fan out, an
/// executor pool's claim/heartbeat/report traffic being the usual reason.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum connections held by this process's pool.
    pub max_connections: u32,
}

impl DbConfig {
    /// Local single-node default.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/graft";

    /// Build a config from the environment, falling back to
    /// [`Self::DEFAULT_URL`].
    pub fn from_env() -> Self {
        Self::new(env::var("GRAFT_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned()))
    }

    /// Build a config from an explicit URL (tests, CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Open a pool against the configured database.
    pub async fn connect(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.database_url)
            .await
            .with_context(|| format!("failed to connect to task store at {}", self.database_url))
    }

    /// Split the URL into its server half and the database name, e.g.
    /// `postgresql://host:5432/graft` -> (`postgresql://host:5432`,
    /// `graft`). `None` when the URL has no database path.
    fn split_database_name(&self) -> Option<(&str, &str)> {
        let pos = self.database_url.rfind('/')?;
        let name = &self.database_url[pos + 1..];
        if name.is_empty() {
            return None;
        }
        Some((&self.database_url[..pos], name))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Create the target database if it does not exist, connect, and run the
/// migrations. Returns the ready pool. Backs `graft db-init`.
pub async fn bootstrap(config: &DbConfig) -> Result<PgPool> {
    let (server, db_name) = config
        .split_database_name()
        .context("could not determine database name from URL")?;

    // Database names cannot be parameterised in CREATE DATABASE; accept
    // plain identifiers only.
    if !db_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        anyhow::bail!("database name {db_name:?} contains invalid characters");
    }

    let maintenance = DbConfig::new(format!("{server}/postgres")).with_max_connections(1);
    let maint_pool = maintenance
        .connect()
        .await
        .context("failed to reach the maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
    } else {
        let stmt = format!("CREATE DATABASE {db_name}");
        maint_pool
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }
    maint_pool.close().await;

    let pool = config.connect().await?;
    run_migrations(&pool, default_migrations_path()).await?;
    Ok(pool)
}

/// Run all pending migrations from the given directory against the pool.
///
/// A runtime `Migrator` keeps the build independent of a live database
/// (the `sqlx::migrate!()` macro would need one at compile time).
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// The migrations shipped with this crate, resolved from its source tree
/// via the compile-time `CARGO_MANIFEST_DIR`.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Row counts for the graft tables, in schema order.
///
/// Assumes the schema is migrated; used for the `graft db-init` success
/// message.
pub async fn schema_counts(pool: &PgPool) -> Result<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(SCHEMA_TABLES.len());
    for table in SCHEMA_TABLES {
        // Table names come from the compile-time list above.
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((*table, count));
    }
    Ok(counts)
}
