//! Local entry store using sqlx with SQLite.
//!
//! Tracked entries are persisted here so local edits that have not reached
//! the remote store survive a restart.

use std::{collections::HashMap, path::Path};

use {
    serde_json::{Error as SerdeJsonError, from_str, to_string},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
    thiserror::Error,
    tracing::debug,
};

use crate::{
    store::schema::{SchemaError, SchemaManager, create_connection_pool, create_memory_pool},
    sync::entry::{EntryState, LocalEntry, RemoteTable},
};

/// Error type for local store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    /// Schema initialization error.
    #[error("Schema error: {0}")]
    SchemaError(#[from] SchemaError),
    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] SerdeJsonError),
    /// A stored row holds a value this build does not understand.
    #[error("Invalid data: {reason}")]
    InvalidData { reason: String },
}

/// Persistent store of tracked entries.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Opens (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the database cannot be opened or its schema
    /// cannot be initialized.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        debug!("Opening sync store at {:?}", path);
        let pool = create_connection_pool(path).await?;
        Self::with_pool(pool).await
    }

    /// Opens a throwaway in-memory store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the schema cannot be initialized.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = create_memory_pool().await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        SchemaManager::new(pool.clone()).initialize_schema().await?;
        Ok(Self { pool })
    }

    /// Inserts or replaces an entry.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the payload cannot be encoded or the write fails.
    pub async fn upsert_entry(&self, entry: &LocalEntry) -> Result<(), StoreError> {
        let payload = to_string(&entry.payload)?;

        sqlx::query(
            r#"
            INSERT INTO sync_entries
                (key, table_name, payload, state, attempts, last_error, terminal, revision,
                 updated_at, retry_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                table_name = excluded.table_name,
                payload = excluded.payload,
                state = excluded.state,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                terminal = excluded.terminal,
                revision = excluded.revision,
                updated_at = excluded.updated_at,
                retry_at = excluded.retry_at
            "#,
        )
        .bind(&entry.key)
        .bind(entry.table.as_str())
        .bind(payload)
        .bind(entry.state.as_str())
        .bind(i64::from(entry.attempts))
        .bind(entry.last_error.as_deref())
        .bind(entry.terminal)
        .bind(revision_to_i64(entry.revision))
        .bind(entry.updated_at)
        .bind(entry.retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes the sync bookkeeping of an entry, leaving its payload untouched.
    ///
    /// Returns `false` when no row exists for the key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the update fails.
    pub async fn update_state(&self, entry: &LocalEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_entries
            SET state = ?, attempts = ?, last_error = ?, terminal = ?, updated_at = ?, retry_at = ?
            WHERE key = ?
            "#,
        )
        .bind(entry.state.as_str())
        .bind(i64::from(entry.attempts))
        .bind(entry.last_error.as_deref())
        .bind(entry.terminal)
        .bind(entry.updated_at)
        .bind(entry.retry_at)
        .bind(&entry.key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes an entry. Returns `false` when no row existed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the delete fails.
    pub async fn delete_entry(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Loads every tracked entry, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the query fails or a row cannot be decoded.
    pub async fn load_entries(&self) -> Result<Vec<LocalEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, table_name, payload, state, attempts, last_error, terminal, revision,
                   updated_at, retry_at
            FROM sync_entries
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Counts entries per state.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the query fails or a state is unknown.
    pub async fn count_by_state(&self) -> Result<HashMap<EntryState, usize>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM sync_entries GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(parse_column(&state)?, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Gets the database connection pool for advanced operations.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<LocalEntry, StoreError> {
    let table: String = row.try_get("table_name")?;
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let attempts: i64 = row.try_get("attempts")?;
    let revision: i64 = row.try_get("revision")?;

    Ok(LocalEntry {
        key: row.try_get("key")?,
        table: parse_column::<RemoteTable>(&table)?,
        payload: from_str(&payload)?,
        state: parse_column(&state)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        terminal: row.try_get("terminal")?,
        revision: u64::try_from(revision).unwrap_or(0),
        updated_at: row.try_get("updated_at")?,
        retry_at: row.try_get("retry_at")?,
        write_token: None,
    })
}

fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|reason| StoreError::InvalidData { reason })
}

fn revision_to_i64(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        store::database::{LocalStore, StoreError},
        sync::entry::{EntryState, LocalEntry, RemoteTable},
    };

    #[test]
    fn test_store_error_display() {
        let error = StoreError::InvalidData {
            reason: "unknown entry state 'lost'".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid data: unknown entry state 'lost'");
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut entry = LocalEntry::new(
            RemoteTable::Collections,
            "collection-9",
            json!({ "title": "Foils", "cards": [1, 2, 3] }),
        );
        store.upsert_entry(&entry).await.unwrap();

        entry.record_edit(RemoteTable::Collections, json!({ "title": "Rare foils" }));
        store.upsert_entry(&entry).await.unwrap();

        let loaded = store.load_entries().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "collection-9");
        assert_eq!(loaded[0].table, RemoteTable::Collections);
        assert_eq!(loaded[0].payload["title"], "Rare foils");
        assert_eq!(loaded[0].revision, 2);
        assert_eq!(loaded[0].state, EntryState::Pending);
    }

    #[tokio::test]
    async fn test_update_state_keeps_payload() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut entry = LocalEntry::new(RemoteTable::Cards, "card-1", json!({ "hp": 120 }));
        store.upsert_entry(&entry).await.unwrap();

        entry.state = EntryState::Failed;
        entry.attempts = 2;
        entry.last_error = Some("Remote network error: offline".to_string());
        entry.retry_at = Some(1_900_000_000_000);
        entry.payload = json!({ "hp": 0 });
        assert!(store.update_state(&entry).await.unwrap());

        let loaded = store.load_entries().await.unwrap();
        assert_eq!(loaded[0].state, EntryState::Failed);
        assert_eq!(loaded[0].attempts, 2);
        assert_eq!(loaded[0].payload["hp"], 120);
        assert!(loaded[0].last_error.is_some());
        assert_eq!(loaded[0].retry_at, Some(1_900_000_000_000));

        let missing = LocalEntry::new(RemoteTable::Cards, "card-404", json!({}));
        assert!(!store.update_state(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for key in ["a", "b", "c"] {
            let mut entry = LocalEntry::new(RemoteTable::Profiles, key, json!({}));
            if key == "c" {
                entry.state = EntryState::Clean;
            }
            store.upsert_entry(&entry).await.unwrap();
        }

        assert!(store.delete_entry("a").await.unwrap());
        assert!(!store.delete_entry("a").await.unwrap());

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.get(&EntryState::Pending), Some(&1));
        assert_eq!(counts.get(&EntryState::Clean), Some(&1));
        assert_eq!(counts.get(&EntryState::Failed), None);
    }

    #[tokio::test]
    async fn test_unknown_state_is_invalid_data() {
        let store = LocalStore::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO sync_entries (key, table_name, payload, state, revision, updated_at) \
             VALUES ('x', 'cards', '{}', 'lost', 1, 0)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let result = store.load_entries().await;
        assert!(matches!(result, Err(StoreError::InvalidData { .. })));
    }
}
