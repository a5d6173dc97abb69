use std::fmt::Debug;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A single user-scoped record that the sync store keeps in step with a remote
/// table.
///
/// `apply` must be a shallow patch: fields absent from the patch are kept.
pub trait SyncRecord: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Patch: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Local cache key for this record type.
    const CACHE_KEY: &'static str;

    /// The empty record a first edit is merged into.
    fn blank(now: &str) -> Self;

    fn id(&self) -> &str;

    fn apply(&mut self, patch: &Self::Patch);

    /// Stamp `updated_at`.
    fn touch(&mut self, now: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Local value matches the last confirmed remote value.
    #[default]
    Clean,
    /// Local edits not yet confirmed remotely.
    Dirty,
    /// An upsert is in flight.
    Syncing,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Syncing => "syncing",
        };
        f.write_str(s)
    }
}
