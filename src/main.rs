//! cardsync - offline-first sync core for the card studio client
//!
//! Loads settings, opens the local entry store, records one card edit per
//! command-line argument, pushes them to an in-memory backend and prints
//! the final sync snapshot as JSON.

use std::{env::args, sync::Arc, time::Duration};

use {
    anyhow::{Result, bail},
    serde_json::{json, to_string_pretty},
    tokio::time::{Instant, timeout_at},
    tracing::info,
    tracing_subscriber::EnvFilter,
};

use cardsync::{
    LocalStore, MemoryRemote, RemoteTable, SettingsManager, SyncEngine, SyncEngineConfig,
    SyncStatusView, error::ResultExt,
};

/// How long the demo waits for the engine to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings_manager = SettingsManager::new().add_context("Failed to load sync settings")?;
    let settings = settings_manager.get_settings().clone();

    let database_path = settings.database_path();
    let store = LocalStore::open(&database_path)
        .await
        .add_contextf(format!("Failed to open sync store at {}", database_path.display()))?;
    let engine = SyncEngine::new(
        store,
        Arc::new(MemoryRemote::new()),
        SyncEngineConfig::from(&settings),
    );

    let view = SyncStatusView::mount_with(&engine, |status| {
        info!(
            pending = status.pending,
            syncing = status.syncing,
            failed = status.failed,
            clean = status.clean,
            "Sync status changed"
        );
    });
    engine.start().await.add_context("Failed to start sync engine")?;

    for key in args().skip(1) {
        engine
            .record_change(RemoteTable::Cards, &key, json!({ "name": key }))
            .await
            .add_contextf(format!("Failed to record card {key}"))?;
    }
    view.sync();

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let mut receiver = engine.subscribe();
    while !engine.status().is_settled() {
        if timeout_at(deadline, receiver.recv()).await.is_err() {
            bail!("Sync did not settle within {:?}", SETTLE_TIMEOUT);
        }
    }

    println!("{}", to_string_pretty(&view.status())?);

    view.unmount();
    engine.stop().await;
    Ok(())
}
