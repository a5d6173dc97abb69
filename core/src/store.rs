//! Offline-first store for a single user-scoped record.
//!
//! Every local edit is merged into the in-memory record and written to the
//! local cache before any remote I/O. Remote upserts happen when the
//! connectivity oracle says we are online; otherwise the store is marked dirty
//! and the latest patch is kept for [`SyncedRecordStore::sync_pending_changes`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::connectivity::Connectivity;
use crate::record::{SyncRecord, SyncState};
use crate::remote::{RemoteStore, SyncError};

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Overrides the record type's cache key.
    pub cache_key: Option<String>,
    /// Upper bound for a single remote call; expiry counts as a transient error.
    pub remote_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_key: None,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

/// Snapshot of the store, as shown to the UI.
#[derive(Debug, Clone)]
pub struct StoreState<R: SyncRecord> {
    pub record: Option<R>,
    pub is_loading: bool,
    /// Last remote failure message.
    pub error: Option<String>,
    pub sync_state: SyncState,
    /// Latest patch not yet confirmed remotely; a retry payload only.
    pub pending_changes: Option<R::Patch>,
}

impl<R: SyncRecord> Default for StoreState<R> {
    fn default() -> Self {
        Self {
            record: None,
            is_loading: false,
            error: None,
            sync_state: SyncState::Clean,
            pending_changes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The remote confirmed the record.
    Synced,
    /// Offline; the edit is kept locally and marked dirty.
    Deferred,
    /// Another upsert was in flight; the edit waits for the next sync.
    Queued,
    /// Nothing to do.
    Skipped,
    /// A sync attempt failed; the changes are still pending.
    Retained,
}

/// Sync metadata persisted next to the record so a restart keeps the dirty flag.
#[derive(Debug, Serialize, Deserialize)]
struct SyncMeta<P> {
    dirty: bool,
    pending_changes: Option<P>,
    #[serde(default)]
    retry_blocked: bool,
}

struct Inner<R: SyncRecord> {
    state: StoreState<R>,
    /// Bumped on every local edit.
    revision: u64,
    /// Bumped on reset; results of calls started before a reset are dropped.
    epoch: u64,
    /// Set after a permanent upsert failure until the next edit.
    retry_blocked: bool,
}

pub struct SyncedRecordStore<R: SyncRecord> {
    inner: Mutex<Inner<R>>,
    remote: Arc<dyn RemoteStore<R>>,
    cache: Arc<dyn LocalCache>,
    connectivity: Arc<dyn Connectivity>,
    config: StoreConfig,
}

impl<R: SyncRecord> SyncedRecordStore<R> {
    pub fn new(
        remote: Arc<dyn RemoteStore<R>>,
        cache: Arc<dyn LocalCache>,
        connectivity: Arc<dyn Connectivity>,
        config: StoreConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StoreState::default(),
                revision: 0,
                epoch: 0,
                retry_blocked: false,
            }),
            remote,
            cache,
            connectivity,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_key(&self) -> &str {
        self.config.cache_key.as_deref().unwrap_or(R::CACHE_KEY)
    }

    fn meta_key(&self) -> String {
        format!("{}.sync", self.record_key())
    }

    // --- Queries ---

    pub fn state(&self) -> StoreState<R> {
        self.lock().state.clone()
    }

    pub fn record(&self) -> Option<R> {
        self.lock().state.record.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.lock().state.sync_state
    }

    pub fn error(&self) -> Option<String> {
        self.lock().state.error.clone()
    }

    pub fn pending_changes(&self) -> Option<R::Patch> {
        self.lock().state.pending_changes.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().state.is_loading
    }

    /// True when the last upsert was rejected permanently and no edit has
    /// happened since.
    pub fn is_retry_blocked(&self) -> bool {
        self.lock().retry_blocked
    }

    pub fn clear_error(&self) {
        self.lock().state.error = None;
    }

    // --- Local cache (best effort, never surfaced) ---

    fn read_cached_record(&self) -> Option<R> {
        let key = self.record_key();
        match self.cache.get(key) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key, error = %e, "discarding unreadable cached record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "failed to read local cache");
                None
            }
        }
    }

    fn write_cached_record(&self, record: &R) {
        let key = self.record_key();
        let result = serde_json::to_string(record)
            .map_err(Into::into)
            .and_then(|json| self.cache.set(key, &json));
        if let Err(e) = result {
            warn!(key, error = %e, "failed to write local cache");
        }
    }

    fn write_meta(&self, inner: &Inner<R>) {
        let key = self.meta_key();
        let meta = SyncMeta {
            dirty: inner.state.sync_state != SyncState::Clean,
            pending_changes: inner.state.pending_changes.clone(),
            retry_blocked: inner.retry_blocked,
        };
        let result = serde_json::to_string(&meta)
            .map_err(Into::into)
            .and_then(|json| self.cache.set(&key, &json));
        if let Err(e) = result {
            warn!(key = %key, error = %e, "failed to persist sync state");
        }
    }

    fn read_meta(&self) -> Option<SyncMeta<R::Patch>> {
        let key = self.meta_key();
        match self.cache.get(&key) {
            Ok(Some(json)) => serde_json::from_str(&json)
                .inspect_err(|e| warn!(key = %key, error = %e, "discarding unreadable sync state"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read sync state");
                None
            }
        }
    }

    fn purge_cache(&self) {
        for key in [self.record_key().to_string(), self.meta_key()] {
            if let Err(e) = self.cache.remove(&key) {
                warn!(key = %key, error = %e, "failed to purge local cache");
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::transient(format!(
                "remote call timed out after {}s",
                self.config.remote_timeout.as_secs()
            ))),
        }
    }

    // --- Operations ---

    /// Rehydrate the record and its sync metadata from the local cache.
    ///
    /// The cache is shared between processes, so this replaces the in-memory
    /// record and sync state with whatever was persisted last, including edits
    /// and resets made elsewhere. A persisted `syncing` comes back as `dirty`:
    /// the upsert never confirmed. Skipped while an upsert is in flight.
    pub fn restore(&self) {
        let record = self.read_cached_record();
        let meta = self.read_meta();
        let mut inner = self.lock();
        if inner.state.sync_state == SyncState::Syncing {
            debug!("upsert in flight, not restoring from local cache");
            return;
        }
        inner.state.record = record;
        match meta {
            Some(meta) if meta.dirty => {
                inner.state.sync_state = SyncState::Dirty;
                inner.state.pending_changes = meta.pending_changes;
                inner.retry_blocked = meta.retry_blocked;
            }
            _ => {
                inner.state.sync_state = SyncState::Clean;
                inner.state.pending_changes = None;
                inner.retry_blocked = false;
            }
        }
        // Results of calls started against the replaced record are stale.
        inner.revision += 1;
        debug!(
            has_record = inner.state.record.is_some(),
            sync_state = %inner.state.sync_state,
            "restored store from local cache"
        );
    }

    /// Load the record: local cache first, then the remote when online.
    ///
    /// A remote "no rows" answer is not an error. Remote failures are recorded
    /// in `error` and returned, and the already loaded record is kept.
    pub async fn fetch(&self) -> Result<Option<R>, SyncError> {
        let cached = self.read_cached_record();
        let (revision, epoch) = {
            let mut inner = self.lock();
            inner.state.is_loading = true;
            inner.state.error = None;
            // An in-memory record is never older than the cache.
            if inner.state.record.is_none() {
                inner.state.record = cached;
            }
            (inner.revision, inner.epoch)
        };

        if !self.connectivity.is_online().await {
            debug!("offline, serving cached record");
            let mut inner = self.lock();
            inner.state.is_loading = false;
            return Ok(inner.state.record.clone());
        }

        let result = self.bounded(self.remote.fetch_one()).await;

        let mut inner = self.lock();
        inner.state.is_loading = false;
        if inner.epoch != epoch {
            debug!("store was reset during fetch, dropping result");
            return Ok(inner.state.record.clone());
        }
        match result {
            Ok(Some(remote)) => {
                if inner.revision != revision || inner.state.sync_state != SyncState::Clean {
                    info!(
                        sync_state = %inner.state.sync_state,
                        "keeping unconfirmed local edits over fetched record"
                    );
                } else {
                    self.write_cached_record(&remote);
                    inner.state.record = Some(remote);
                    inner.state.sync_state = SyncState::Clean;
                    inner.state.pending_changes = None;
                }
            }
            Ok(None) => debug!("remote has no record yet"),
            Err(e) => {
                warn!(error = %e, "failed to fetch record");
                inner.state.error = Some(e.to_string());
                return Err(e);
            }
        }
        Ok(inner.state.record.clone())
    }

    /// Apply a local edit and try to push the merged record.
    ///
    /// The merged record reaches the local cache before any remote call, so an
    /// edit is never lost. Being offline is not an error
    /// ([`SyncOutcome::Deferred`]). A failed upsert leaves the edit in place,
    /// marks the store dirty and returns the error.
    pub async fn update(&self, patch: R::Patch) -> Result<SyncOutcome, SyncError> {
        let now = Utc::now().to_rfc3339();
        let epoch = {
            let mut inner = self.lock();
            let mut record = inner
                .state
                .record
                .take()
                .unwrap_or_else(|| R::blank(&now));
            record.apply(&patch);
            record.touch(&now);
            self.write_cached_record(&record);
            inner.state.record = Some(record);
            inner.state.pending_changes = Some(patch);
            inner.revision += 1;
            inner.retry_blocked = false;
            if inner.state.sync_state == SyncState::Clean {
                inner.state.sync_state = SyncState::Dirty;
            }
            self.write_meta(&inner);
            inner.epoch
        };

        if !self.connectivity.is_online().await {
            debug!("offline, deferring upsert");
            return Ok(SyncOutcome::Deferred);
        }

        let (record, revision) = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return Ok(SyncOutcome::Skipped);
            }
            if inner.state.sync_state == SyncState::Syncing {
                debug!("upsert in flight, queueing edit");
                return Ok(SyncOutcome::Queued);
            }
            let Some(record) = inner.state.record.clone() else {
                return Ok(SyncOutcome::Skipped);
            };
            inner.state.sync_state = SyncState::Syncing;
            (record, inner.revision)
        };

        let result = self.bounded(self.remote.upsert(&record)).await;

        let mut inner = self.lock();
        if inner.epoch != epoch {
            debug!("store was reset during upsert, dropping result");
            return Ok(SyncOutcome::Skipped);
        }
        match result {
            Ok(()) => {
                if inner.revision == revision {
                    inner.state.sync_state = SyncState::Clean;
                    inner.state.pending_changes = None;
                } else {
                    inner.state.sync_state = SyncState::Dirty;
                }
                inner.state.error = None;
                self.write_meta(&inner);
                debug!(id = record.id(), "record synced");
                Ok(SyncOutcome::Synced)
            }
            Err(e) => {
                match e {
                    SyncError::Transient(_) => {
                        warn!(error = %e, "upsert failed, will retry");
                    }
                    SyncError::Permanent(_) if inner.revision == revision => {
                        warn!(error = %e, "upsert rejected, retries suspended until next edit");
                        inner.retry_blocked = true;
                    }
                    SyncError::Permanent(_) => {
                        warn!(error = %e, "upsert rejected, a newer edit is pending");
                    }
                }
                inner.state.sync_state = SyncState::Dirty;
                inner.state.error = Some(e.to_string());
                self.write_meta(&inner);
                Err(e)
            }
        }
    }

    /// Re-push pending changes, e.g. after connectivity comes back.
    ///
    /// Failures are logged and swallowed; the changes stay pending for the
    /// next trigger.
    pub async fn sync_pending_changes(&self) -> SyncOutcome {
        let patch = {
            let inner = self.lock();
            if inner.state.sync_state != SyncState::Dirty {
                return SyncOutcome::Skipped;
            }
            let Some(patch) = inner.state.pending_changes.clone() else {
                return SyncOutcome::Skipped;
            };
            if inner.retry_blocked {
                warn!("pending changes were rejected by the remote, not retrying");
                return SyncOutcome::Skipped;
            }
            patch
        };

        if !self.connectivity.is_online().await {
            return SyncOutcome::Skipped;
        }

        match self.update(patch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "failed to sync pending changes");
                SyncOutcome::Retained
            }
        }
    }

    /// Forget the record (e.g. on sign-out) and purge the local cache.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = StoreState::default();
        inner.epoch += 1;
        inner.retry_blocked = false;
        self.purge_cache();
        info!("store reset");
    }
}
