pub mod cache;
pub mod connectivity;
pub mod db;
pub mod models;
pub mod record;
pub mod remote;
pub mod store;

pub use cache::{CacheError, LocalCache, SqliteCache};
pub use connectivity::{Connectivity, StaticConnectivity};
pub use record::{SyncRecord, SyncState};
pub use remote::{RemoteStore, SyncError};
pub use store::{StoreConfig, StoreState, SyncOutcome, SyncedRecordStore};
