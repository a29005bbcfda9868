//! Database schema definition and versioning for the local entry store.

use std::{path::Path, str::FromStr};

use {
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    },
    thiserror::Error,
    tracing::debug,
};

/// Error type for schema operations.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),
    /// Schema migration error.
    #[error("Schema migration error: {reason}")]
    MigrationError { reason: String },
}

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Creates and checks the entry tables.
pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    /// Creates a new schema manager.
    ///
    /// # Arguments
    ///
    /// * `pool` - The SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initializes the database schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` if table creation fails or the database holds
    /// a schema version this build cannot migrate.
    pub async fn initialize_schema(&self) -> Result<(), SchemaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current_version: Option<i32> =
            sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        match current_version {
            None => {
                debug!("Creating sync store schema v{}", CURRENT_SCHEMA_VERSION);
                self.create_tables().await?;
                sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                    .bind(CURRENT_SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
            Some(version) if version == CURRENT_SCHEMA_VERSION => {}
            Some(1) => {
                debug!("Migrating sync store schema v1 to v{}", CURRENT_SCHEMA_VERSION);
                self.migrate_v1_to_v2().await?;
            }
            Some(version) => {
                return Err(SchemaError::MigrationError {
                    reason: format!(
                        "cannot migrate sync store from version {version} to {CURRENT_SCHEMA_VERSION}"
                    ),
                });
            }
        }

        Ok(())
    }

    async fn create_tables(&self) -> Result<(), SchemaError> {
        sqlx::query(
            r#"
            CREATE TABLE sync_entries (
                key TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                terminal BOOLEAN NOT NULL DEFAULT FALSE,
                revision INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                retry_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX idx_sync_entries_state ON sync_entries (state)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Adds the persisted retry time.
    async fn migrate_v1_to_v2(&self) -> Result<(), SchemaError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("ALTER TABLE sync_entries ADD COLUMN retry_at INTEGER")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE schema_version SET version = ?")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Gets the current schema version, or 0 if not initialized.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` if the version table cannot be read.
    pub async fn get_current_version(&self) -> Result<i32, SchemaError> {
        let has_table: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        )
        .fetch_optional(&self.pool)
        .await?;
        if has_table.is_none() {
            return Ok(0);
        }

        let version: Option<i32> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(version.unwrap_or(0))
    }
}

/// Opens a WAL-mode connection pool on the database file at `path`.
///
/// # Errors
///
/// Returns `SchemaError` if the file cannot be opened or created.
pub async fn create_connection_pool(path: &Path) -> Result<SqlitePool, SchemaError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SchemaError::MigrationError {
            reason: format!("cannot create {}: {e}", parent.display()),
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Opens a private in-memory database.
///
/// The pool is pinned to a single connection; every SQLite memory
/// connection is its own database.
///
/// # Errors
///
/// Returns `SchemaError` if the connection cannot be opened.
pub async fn create_memory_pool() -> Result<SqlitePool, SchemaError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use crate::store::schema::{
        CURRENT_SCHEMA_VERSION, SchemaError, SchemaManager, create_memory_pool,
    };

    #[test]
    fn test_schema_error_display() {
        let migration_error = SchemaError::MigrationError {
            reason: "test error".to_string(),
        };
        assert_eq!(
            migration_error.to_string(),
            "Schema migration error: test error"
        );
    }

    #[tokio::test]
    async fn test_initialize_schema_is_idempotent() {
        let pool = create_memory_pool().await.unwrap();
        let manager = SchemaManager::new(pool);

        assert_eq!(manager.get_current_version().await.unwrap(), 0);
        manager.initialize_schema().await.unwrap();
        manager.initialize_schema().await.unwrap();
        assert_eq!(
            manager.get_current_version().await.unwrap(),
            CURRENT_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_version_one_gains_retry_column() {
        let pool = create_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE schema_version (version INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE sync_entries (key TEXT PRIMARY KEY, table_name TEXT NOT NULL, \
             payload TEXT NOT NULL, state TEXT NOT NULL, attempts INTEGER NOT NULL DEFAULT 0, \
             last_error TEXT, terminal BOOLEAN NOT NULL DEFAULT FALSE, \
             revision INTEGER NOT NULL, updated_at INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let manager = SchemaManager::new(pool.clone());
        assert_eq!(manager.get_current_version().await.unwrap(), 1);
        manager.initialize_schema().await.unwrap();
        assert_eq!(
            manager.get_current_version().await.unwrap(),
            CURRENT_SCHEMA_VERSION
        );

        let retry_at: Option<i64> = sqlx::query_scalar("SELECT retry_at FROM sync_entries")
            .fetch_optional(&pool)
            .await
            .unwrap()
            .flatten();
        assert!(retry_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let pool = create_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE schema_version (version INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_version (version) VALUES (99)")
            .execute(&pool)
            .await
            .unwrap();

        let result = SchemaManager::new(pool).initialize_schema().await;
        assert!(matches!(result, Err(SchemaError::MigrationError { .. })));
    }
}
