use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::Profile;

/// Outcome of a client upsert against the profiles table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileWrite {
    Written(Profile),
    /// The row id belongs to another user.
    NotOwner,
}

/// Server-side store: one profile row per user, plus hashed API keys.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS profiles (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL UNIQUE,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS api_keys (
                    key_hash TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Profiles ---

    pub fn get_profile_for_user(&self, user_id: &str) -> Result<Option<Profile>> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(json) => {
                let profile = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt profile row for user '{user_id}'"))?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace the caller's profile by id.
    ///
    /// `user_id` on the stored row always comes from the authenticated caller,
    /// never from the payload. Last write wins. A user owns one row: a write
    /// under a new id (a fresh device, or an edit after sign-out) replaces the
    /// caller's row and re-keys it to the incoming id.
    pub fn upsert_profile(&self, user_id: &str, profile: &Profile) -> Result<ProfileWrite> {
        let owner: Option<String> = self
            .conn
            .query_row(
                "SELECT user_id FROM profiles WHERE id = ?1",
                params![profile.id],
                |row| row.get(0),
            )
            .optional()?;
        if owner.as_deref().is_some_and(|owner| owner != user_id) {
            return Ok(ProfileWrite::NotOwner);
        }

        let existing_id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        let mut stored = profile.clone();
        stored.user_id = user_id.to_string();
        let data = serde_json::to_string(&stored)?;
        match existing_id {
            Some(existing_id) if existing_id != stored.id => {
                self.conn.execute(
                    "UPDATE profiles SET id = ?1, data = ?2, updated_at = ?3 WHERE user_id = ?4",
                    params![stored.id, data, stored.updated_at, user_id],
                )?;
            }
            _ => {
                self.conn.execute(
                    "INSERT INTO profiles (id, user_id, data, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                    params![stored.id, user_id, data, stored.updated_at],
                )?;
            }
        }
        Ok(ProfileWrite::Written(stored))
    }

    pub fn delete_profile_for_user(&self, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM profiles WHERE user_id = ?1", params![user_id])?;
        Ok(rows > 0)
    }

    // --- API keys ---

    pub fn register_api_key(&self, key_hash: &str, user_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO api_keys (key_hash, user_id, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key_hash) DO UPDATE SET user_id = excluded.user_id",
            params![key_hash, user_id, now],
        )?;
        Ok(())
    }

    pub fn user_for_key_hash(&self, key_hash: &str) -> Result<Option<String>> {
        let user = self
            .conn
            .query_row(
                "SELECT user_id FROM api_keys WHERE key_hash = ?1",
                params![key_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user)
    }

    pub fn revoke_keys_for_user(&self, user_id: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM api_keys WHERE user_id = ?1", params![user_id])?;
        Ok(rows)
    }
}
