//! Pushes newly catalogued faces to the remote index.
//!
//! A pass walks the catalogue through [`Store::watch`]. When nothing is
//! newer than the last successful pass and no unseen key appeared it
//! returns without touching the remote service. Otherwise it lists the remote collection once, indexes
//! every local key the collection lacks, and advances the sync timestamp.
//! A key that fails to push is logged and skipped; it is retried on the
//! next pass that sees a catalogue change.

use crate::face_key::FaceKey;
use crate::periodic::Periodic;
use crate::recognition::{RecognitionClient, RecognitionError};
use crate::store::{Store, StoreError};
use crate::types::RemoteIndexEntry;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("catalogue scan failed: {0}")]
    Store(#[from] StoreError),
    #[error("listing remote index failed: {0}")]
    List(#[from] RecognitionError),
}

/// Failure to push a single key.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("read failed: {0}")]
    Read(#[from] StoreError),
    #[error("index failed: {0}")]
    Index(#[from] RecognitionError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub collection_id: String,
    pub interval: Duration,
}

impl SyncConfig {
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// In-memory sync bookkeeping; lost on restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Newest catalogue modification time covered by a successful pass.
    pub last_synced: Option<SystemTime>,
    /// Local keys seen by that pass.
    pub synced_keys: HashSet<FaceKey>,
}

/// Outcome of one [`CatalogueSynchronizer::sync`] pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Nothing changed since the last pass; no remote calls were made.
    pub unchanged: bool,
    pub local: usize,
    pub remote: usize,
    pub indexed: Vec<FaceKey>,
    pub failed: Vec<(FaceKey, String)>,
}

impl SyncReport {
    fn unchanged() -> Self {
        Self {
            unchanged: true,
            ..Self::default()
        }
    }
}

pub struct CatalogueSynchronizer<S: ?Sized, R: ?Sized> {
    store: Arc<S>,
    client: Arc<R>,
    config: SyncConfig,
    state: SyncState,
}

impl<S, R> CatalogueSynchronizer<S, R>
where
    S: Store + ?Sized,
    R: RecognitionClient + ?Sized,
{
    pub fn new(store: Arc<S>, client: Arc<R>, config: SyncConfig) -> Self {
        Self {
            store,
            client,
            config,
            state: SyncState::default(),
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Run one sync pass.
    ///
    /// Errors only when the catalogue walk or the remote listing fails;
    /// the sync timestamp is left untouched in that case.
    pub async fn sync(&mut self) -> Result<SyncReport, SyncError> {
        let Some(change) = self
            .store
            .watch(self.state.last_synced, &self.state.synced_keys)
            .await?
        else {
            tracing::trace!("catalogue unchanged since last sync");
            return Ok(SyncReport::unchanged());
        };

        let remote = self.client.list_indexed(&self.config.collection_id).await?;
        let remote_keys: HashSet<FaceKey> = remote
            .iter()
            .filter_map(RemoteIndexEntry::from_remote)
            .map(|entry| entry.key)
            .collect();

        let missing = missing_keys(change.keys(), &remote_keys);
        tracing::debug!(
            local = change.entries.len(),
            remote = remote_keys.len(),
            missing = missing.len(),
            "catalogue diff"
        );

        let mut report = SyncReport {
            unchanged: false,
            local: change.entries.len(),
            remote: remote_keys.len(),
            ..SyncReport::default()
        };

        for key in missing {
            match self.push(&key).await {
                Ok(()) => {
                    tracing::info!(key = %key, "indexed new face");
                    report.indexed.push(key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to index face");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        self.state.last_synced = Some(change.last_modified);
        self.state.synced_keys = change.keys().cloned().collect();
        Ok(report)
    }

    async fn push(&self, key: &FaceKey) -> Result<(), PushError> {
        let image = self.store.read_image(key).await?;
        self.client
            .index_image(&image, &self.config.collection_id, &key.external_id())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<S, R> Periodic for CatalogueSynchronizer<S, R>
where
    S: Store + ?Sized + 'static,
    R: RecognitionClient + ?Sized + 'static,
{
    async fn tick(&mut self) {
        match self.sync().await {
            Ok(report) if report.unchanged => {}
            Ok(report) => tracing::info!(
                local = report.local,
                remote = report.remote,
                indexed = report.indexed.len(),
                failed = report.failed.len(),
                "catalogue sync pass complete"
            ),
            Err(e) => tracing::warn!(error = %e, "catalogue sync pass failed"),
        }
    }
}

/// Local keys absent from `remote`, in local order, each once.
fn missing_keys<'a>(
    local: impl Iterator<Item = &'a FaceKey>,
    remote: &HashSet<FaceKey>,
) -> Vec<FaceKey> {
    let mut seen = HashSet::new();
    local
        .filter(|key| !remote.contains(*key) && seen.insert(*key))
        .cloned()
        .collect()
}
