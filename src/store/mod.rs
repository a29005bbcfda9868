//! Local persistence of tracked entries.
//!
//! This module provides the SQLite-backed entry store and its schema management.

pub mod database;
pub mod schema;

pub use {
    database::{LocalStore, StoreError},
    schema::{CURRENT_SCHEMA_VERSION, SchemaError, SchemaManager},
};
