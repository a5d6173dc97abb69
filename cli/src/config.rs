use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub struct Config {
    /// Local cache for the offline-first store.
    pub cache_path: PathBuf,
    /// Backend database used by `serve` and `keys`.
    pub server_db_path: PathBuf,
    pub data_dir: PathBuf,
}

/// Backend connection written by `cardsync connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "cardsync").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir())
    }

    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        let data_dir = data_dir.to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Config {
            cache_path: data_dir.join("cache.db"),
            server_db_path: data_dir.join("server.db"),
            data_dir,
        })
    }

    fn remote_path(&self) -> PathBuf {
        self.data_dir.join("remote.json")
    }

    pub fn load_remote(&self) -> Result<RemoteSettings> {
        let path = self.remote_path();
        if !path.exists() {
            return Ok(RemoteSettings::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn save_remote(&self, settings: &RemoteSettings) -> Result<()> {
        let path = self.remote_path();
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        restrict_permissions(&path)
    }

    /// Load the owner's API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let key = generate_api_key();
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        restrict_permissions(&path)?;
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_api_key() -> String {
    use rand::Rng;
    use std::fmt::Write;

    let bytes: [u8; 32] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(64), |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path()).unwrap();
        assert_eq!(config.cache_path, dir.path().join("cache.db"));
        assert_eq!(config.server_db_path, dir.path().join("server.db"));
    }

    #[test]
    fn test_remote_settings_roundtrip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path()).unwrap();
        assert_eq!(config.load_remote().unwrap(), RemoteSettings::default());

        let settings = RemoteSettings {
            server_url: Some("http://192.168.1.10:8080".to_string()),
            api_key: Some("abc".to_string()),
        };
        config.save_remote(&settings).unwrap();
        assert_eq!(config.load_remote().unwrap(), settings);
    }

    #[test]
    fn test_api_key_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path()).unwrap();

        let (key, created) = config.load_or_create_api_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

        let (again, created) = config.load_or_create_api_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
    }

    #[cfg(unix)]
    #[test]
    fn test_api_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path()).unwrap();
        config.load_or_create_api_key().unwrap();
        let mode = std::fs::metadata(dir.path().join("api_key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
