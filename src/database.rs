//! Embedded SQLite database for the message store projection
//!
//! Separation here: configuration validation and connection-string logic is
//! pure; file system and pool operations are isolated to the imperative
//! methods on [`DatabaseConnection`]. Table creation is handled by the
//! embedded migration system during `DatabaseConnection::initialize()`.

use nutype::nutype;
use sqlx::{Pool, Sqlite, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Static migrator for embedded `SQLite` migrations.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database-specific error types.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error from `SQLx`.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration failure.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// File system I/O error.
    #[error("file system error: {message}")]
    FileSystem { message: String },

    /// Invalid configuration.
    #[error("configuration error: {field} - {reason}")]
    Configuration { field: String, reason: String },
}

/// Database result type.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[nutype(
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Create a new database path with validation.
    pub fn parse<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        Self::try_new(path.as_ref().to_path_buf()).map_err(|_| DatabaseError::Configuration {
            field: "database_path".to_string(),
            reason: "path is empty or has invalid extension (must be .db)".to_string(),
        })
    }

    /// Get the path as `PathBuf`.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Parent directory for file creation.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Database configuration with connection pool settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    max_connections: u32,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    /// Create new database config with default settings.
    #[must_use]
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            max_connections: 8,
            enable_wal_mode: true,
        }
    }

    /// Minimal settings for tests: one connection, no WAL journalling.
    #[must_use]
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            max_connections: 1,
            enable_wal_mode: false,
        }
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }
}

/// Database connection with managed pool.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection").finish_non_exhaustive()
    }
}

impl DatabaseConnection {
    /// Generate `SQLite` options from config (pure).
    fn create_connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true);

        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        // The store is a projection of the engine WAL; NORMAL is enough.
        options = options.pragma("synchronous", "NORMAL");

        options.disable_statement_logging()
    }

    /// Initialize the connection pool and run embedded migrations.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent).await.map_err(|e| {
                DatabaseError::FileSystem {
                    message: format!("failed to create directory {}: {e}", parent.display()),
                }
            })?;
        }

        let options = Self::create_connect_options(&config);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!(path = %config.path(), "message store database ready");

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
