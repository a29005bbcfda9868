//! Remote backend seam.
//!
//! The hosted backend (tables behind an authenticated client) is reached
//! only through [`RemoteStore`]. Every call returns an explicit
//! `Result<_, RemoteError>` so callers can tell an empty success from a
//! failed request.

use {async_trait::async_trait, serde_json::Value};

use crate::{error::domain::RemoteError, sync::entry::RemoteTable};

pub mod memory;

pub use memory::MemoryRemote;

/// Table-style write access to the hosted backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts or replaces the row identified by `key`.
    async fn upsert(&self, table: RemoteTable, key: &str, payload: &Value)
    -> Result<(), RemoteError>;

    /// Deletes the row identified by `key`. Deleting a missing row succeeds.
    async fn delete(&self, table: RemoteTable, key: &str) -> Result<(), RemoteError>;
}
