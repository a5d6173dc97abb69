use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::info;

use cardsync_core::connectivity::Connectivity;
use cardsync_core::models::ProfilePatch;
use cardsync_core::record::SyncState;
use cardsync_core::store::SyncOutcome;

use super::ProfileStore;

#[derive(Serialize)]
struct StatusReport {
    server: Option<String>,
    online: bool,
    sync_state: SyncState,
    profile_id: Option<String>,
    updated_at: Option<String>,
    pending_changes: Option<ProfilePatch>,
    retry_blocked: bool,
}

pub(crate) async fn cmd_status(
    store: &ProfileStore,
    connectivity: &dyn Connectivity,
    server: Option<&str>,
    json: bool,
) -> Result<()> {
    store.restore();
    let state = store.state();
    let report = StatusReport {
        server: server.map(str::to_string),
        online: connectivity.is_online().await,
        sync_state: state.sync_state,
        profile_id: state.record.as_ref().map(|p| p.id.clone()),
        updated_at: state.record.as_ref().map(|p| p.updated_at.clone()),
        pending_changes: state.pending_changes,
        retry_blocked: store.is_retry_blocked(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Server:  {}", report.server.as_deref().unwrap_or("(not connected)"));
    println!("Online:  {}", if report.online { "yes" } else { "no" });
    match report.profile_id {
        Some(ref id) => println!(
            "Profile: {id} (updated {})",
            report.updated_at.as_deref().unwrap_or("-")
        ),
        None => println!("Profile: none"),
    }
    println!("Sync:    {}", report.sync_state);
    if report.pending_changes.is_some() {
        println!("Pending: local edits not yet on the server");
    }
    if report.retry_blocked {
        println!("Blocked: the server rejected the last edit; edit the profile to retry");
    }
    Ok(())
}

fn describe(outcome: SyncOutcome, store: &ProfileStore) -> String {
    match outcome {
        SyncOutcome::Synced if store.sync_state() == SyncState::Clean => "Synced.".to_string(),
        SyncOutcome::Synced => "Synced; newer edits are still pending.".to_string(),
        SyncOutcome::Retained => format!(
            "Sync failed ({}); changes kept for the next attempt.",
            store.error().unwrap_or_default()
        ),
        SyncOutcome::Skipped if store.is_retry_blocked() => {
            "Not retrying: the server rejected these changes. Edit the profile to try again."
                .to_string()
        }
        SyncOutcome::Skipped if store.sync_state() == SyncState::Dirty => {
            "Offline; changes stay pending.".to_string()
        }
        SyncOutcome::Deferred => "Offline; changes stay pending.".to_string(),
        SyncOutcome::Skipped | SyncOutcome::Queued => "Nothing to sync.".to_string(),
    }
}

/// Push pending changes once, or with `watch` whenever the backend becomes
/// reachable again.
pub(crate) async fn cmd_sync(
    store: &ProfileStore,
    connectivity: &dyn Connectivity,
    watch: bool,
    interval_secs: u64,
) -> Result<()> {
    if !watch {
        store.restore();
        let outcome = store.sync_pending_changes().await;
        println!("{}", describe(outcome, store));
        return Ok(());
    }

    if interval_secs == 0 {
        bail!("--interval must be at least 1 second");
    }
    eprintln!("Watching connectivity every {interval_secs}s (Ctrl-C to stop)");

    let mut was_online = false;
    loop {
        was_online = watch_tick(store, connectivity, was_online).await;
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
}

/// One pass of `sync --watch`. Returns whether the backend was reachable.
async fn watch_tick(
    store: &ProfileStore,
    connectivity: &dyn Connectivity,
    was_online: bool,
) -> bool {
    // Other cardsync commands may have edited the cache since the last pass.
    store.restore();
    let online = connectivity.is_online().await;
    if online != was_online {
        info!(online, "connectivity changed");
        println!("{}", if online { "Back online." } else { "Offline." });
    }
    // Each reconnect triggers a sync; failed attempts retry on the next tick.
    if online && store.sync_state() == SyncState::Dirty {
        let outcome = store.sync_pending_changes().await;
        if outcome != SyncOutcome::Skipped || !was_online {
            println!("{}", describe(outcome, store));
        }
    }
    online
}

/// Sign out: drop the record and purge the local cache.
pub(crate) fn cmd_reset(store: &ProfileStore, force: bool) -> Result<()> {
    store.restore();
    if store.sync_state() != SyncState::Clean && !force {
        bail!("You have local edits that are not on the server. Run `cardsync sync` first, or pass --force to discard them");
    }
    store.reset();
    println!("Signed out. Local profile removed.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use cardsync_core::cache::{LocalCache, SqliteCache};
    use cardsync_core::connectivity::StaticConnectivity;
    use cardsync_core::models::Profile;
    use cardsync_core::record::SyncRecord;
    use cardsync_core::remote::{RemoteStore, SyncError};
    use cardsync_core::store::{StoreConfig, SyncedRecordStore};

    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl RemoteStore<Profile> for AcceptAll {
        async fn fetch_one(&self) -> Result<Option<Profile>, SyncError> {
            Ok(None)
        }

        async fn upsert(&self, _record: &Profile) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        row: Mutex<Option<Profile>>,
    }

    #[async_trait]
    impl RemoteStore<Profile> for RecordingRemote {
        async fn fetch_one(&self) -> Result<Option<Profile>, SyncError> {
            Ok(self.row.lock().unwrap().clone())
        }

        async fn upsert(&self, record: &Profile) -> Result<(), SyncError> {
            *self.row.lock().unwrap() = Some(record.clone());
            Ok(())
        }
    }

    fn offline_store(cache: Arc<SqliteCache>) -> ProfileStore {
        SyncedRecordStore::new(
            Arc::new(AcceptAll),
            cache,
            Arc::new(StaticConnectivity::new(false)),
            StoreConfig::default(),
        )
    }

    fn name_patch() -> ProfilePatch {
        ProfilePatch {
            name: Some("Ada".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reset_refuses_to_drop_unsynced_edits() {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let store = offline_store(cache.clone());
        store.update(name_patch()).await.unwrap();

        let err = cmd_reset(&store, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert!(store.record().is_some());

        cmd_reset(&store, true).unwrap();
        assert!(store.record().is_none());
        assert!(cache.get(Profile::CACHE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn describe_offline_and_clean() {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let store = offline_store(cache);
        assert_eq!(describe(SyncOutcome::Skipped, &store), "Nothing to sync.");

        store.update(name_patch()).await.unwrap();
        assert_eq!(
            describe(SyncOutcome::Skipped, &store),
            "Offline; changes stay pending."
        );
    }

    #[tokio::test]
    async fn sync_once_pushes_pending_changes() {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        offline_store(cache.clone())
            .update(name_patch())
            .await
            .unwrap();

        // New process, now online
        let online = Arc::new(StaticConnectivity::new(true));
        let store: ProfileStore = SyncedRecordStore::new(
            Arc::new(AcceptAll),
            cache,
            online.clone(),
            StoreConfig::default(),
        );
        cmd_sync(&store, online.as_ref(), false, 30).await.unwrap();
        assert_eq!(store.sync_state(), SyncState::Clean);
    }

    #[tokio::test]
    async fn watch_tick_pushes_edits_made_by_other_commands() {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let remote = Arc::new(RecordingRemote::default());
        let online = Arc::new(StaticConnectivity::new(false));
        let store_over_cache = || -> ProfileStore {
            SyncedRecordStore::new(
                remote.clone(),
                cache.clone(),
                online.clone(),
                StoreConfig::default(),
            )
        };

        let watcher = store_over_cache();
        watcher.restore();
        watcher.update(name_patch()).await.unwrap();
        assert!(!watch_tick(&watcher, online.as_ref(), false).await);

        // `cardsync profile set --title CTO` while the watcher idles offline
        let other = store_over_cache();
        other.restore();
        other
            .update(ProfilePatch {
                title: Some("CTO".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        online.set_online(true);
        assert!(watch_tick(&watcher, online.as_ref(), false).await);

        let row = remote.row.lock().unwrap().clone().unwrap();
        assert_eq!(row.name, "Ada");
        assert_eq!(row.title, "CTO");
        let cached: Profile =
            serde_json::from_str(&cache.get(Profile::CACHE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(cached.title, "CTO");
        assert_eq!(watcher.sync_state(), SyncState::Clean);
    }

    #[tokio::test]
    async fn watch_tick_picks_up_edits_when_started_clean() {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let remote = Arc::new(RecordingRemote::default());
        let online = Arc::new(StaticConnectivity::new(true));
        let watcher: ProfileStore = SyncedRecordStore::new(
            remote.clone(),
            cache.clone(),
            online.clone(),
            StoreConfig::default(),
        );
        assert!(watch_tick(&watcher, online.as_ref(), false).await);
        assert!(remote.row.lock().unwrap().is_none());

        offline_store(cache).update(name_patch()).await.unwrap();

        watch_tick(&watcher, online.as_ref(), true).await;
        assert_eq!(remote.row.lock().unwrap().clone().unwrap().name, "Ada");
    }
}
