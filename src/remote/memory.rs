//! In-memory remote backend with failure injection.

use std::{collections::HashMap, time::Duration};

use {
    async_trait::async_trait,
    parking_lot::{Mutex, RwLock},
    serde_json::Value,
    tokio::time::sleep,
    tracing::debug,
};

use crate::{
    error::domain::{RemoteError, RemoteErrorKind},
    remote::RemoteStore,
    sync::entry::RemoteTable,
};

#[derive(Debug, Clone, Copy)]
enum FailureRule {
    /// Fail this many more writes, then succeed.
    Times(usize, RemoteErrorKind),
    /// Fail every write.
    Always(RemoteErrorKind),
}

/// Thread-safe in-memory stand-in for the hosted tables.
///
/// Used by the demo binary and tests. Failures can be scripted per key.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    /// Stored rows by table and key.
    rows: RwLock<HashMap<(RemoteTable, String), Value>>,
    /// Scripted failures by key.
    failures: Mutex<HashMap<String, FailureRule>>,
    /// Artificial latency applied to every call.
    latency: Option<Duration>,
    /// Number of write calls received, including failed ones.
    calls: Mutex<usize>,
}

impl MemoryRemote {
    /// Creates an empty backend that answers immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend that waits `latency` before every answer.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Makes the next `times` writes of `key` fail with `kind`.
    pub fn fail_next(&self, key: impl Into<String>, times: usize, kind: RemoteErrorKind) {
        self.failures
            .lock()
            .insert(key.into(), FailureRule::Times(times, kind));
    }

    /// Makes every write of `key` fail with `kind`.
    pub fn fail_always(&self, key: impl Into<String>, kind: RemoteErrorKind) {
        self.failures
            .lock()
            .insert(key.into(), FailureRule::Always(kind));
    }

    /// Removes all scripted failures.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Returns the stored row, if any.
    pub fn row(&self, table: RemoteTable, key: &str) -> Option<Value> {
        self.rows.read().get(&(table, key.to_string())).cloned()
    }

    /// Number of stored rows across all tables.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of write calls received so far.
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }

    async fn begin_call(&self, key: &str) -> Result<(), RemoteError> {
        *self.calls.lock() += 1;
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }

        let mut failures = self.failures.lock();
        let kind = match failures.get_mut(key) {
            Some(FailureRule::Always(kind)) => Some(*kind),
            Some(FailureRule::Times(remaining, kind)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*kind)
            }
            _ => None,
        };

        match kind {
            Some(kind) => {
                debug!(key, %kind, "Scripted remote failure");
                Err(RemoteError::new(kind, format!("scripted failure for {key}")))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(
        &self,
        table: RemoteTable,
        key: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.begin_call(key).await?;
        self.rows
            .write()
            .insert((table, key.to_string()), payload.clone());
        Ok(())
    }

    async fn delete(&self, table: RemoteTable, key: &str) -> Result<(), RemoteError> {
        self.begin_call(key).await?;
        self.rows.write().remove(&(table, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        error::domain::RemoteErrorKind,
        remote::{MemoryRemote, RemoteStore},
        sync::entry::RemoteTable,
    };

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let remote = MemoryRemote::new();
        remote
            .upsert(RemoteTable::Cards, "card-1", &json!({ "name": "Ember Drake" }))
            .await
            .unwrap();
        assert_eq!(
            remote.row(RemoteTable::Cards, "card-1"),
            Some(json!({ "name": "Ember Drake" }))
        );
        assert!(remote.row(RemoteTable::Profiles, "card-1").is_none());

        remote.delete(RemoteTable::Cards, "card-1").await.unwrap();
        remote.delete(RemoteTable::Cards, "card-1").await.unwrap();
        assert!(remote.is_empty());
        assert_eq!(remote.calls(), 3);
    }

    #[tokio::test]
    async fn test_fail_next_then_succeed() {
        let remote = MemoryRemote::new();
        remote.fail_next("card-1", 2, RemoteErrorKind::Network);

        for _ in 0..2 {
            let error = remote
                .upsert(RemoteTable::Cards, "card-1", &json!({}))
                .await
                .unwrap_err();
            assert_eq!(error.kind, RemoteErrorKind::Network);
        }
        remote
            .upsert(RemoteTable::Cards, "card-1", &json!({}))
            .await
            .unwrap();
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_always_until_cleared() {
        let remote = MemoryRemote::new();
        remote.fail_always("card-1", RemoteErrorKind::Unauthorized);

        assert!(
            remote
                .upsert(RemoteTable::Cards, "card-1", &json!({}))
                .await
                .is_err()
        );
        assert!(
            remote
                .upsert(RemoteTable::Cards, "card-2", &json!({}))
                .await
                .is_ok()
        );

        remote.clear_failures();
        assert!(
            remote
                .upsert(RemoteTable::Cards, "card-1", &json!({}))
                .await
                .is_ok()
        );
    }
}
