mod helpers;
mod keys;
mod profile;
mod sync;

use cardsync_core::models::Profile;
use cardsync_core::store::SyncedRecordStore;

pub(crate) use keys::{cmd_connect, cmd_keys_issue, cmd_keys_revoke};
pub(crate) use profile::{ProfileEdit, cmd_profile_set, cmd_profile_show};
pub(crate) use sync::{cmd_reset, cmd_status, cmd_sync};

pub(crate) type ProfileStore = SyncedRecordStore<Profile>;
