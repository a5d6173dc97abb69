use anyhow::{Result, bail};
use serde_json::json;

use cardsync_core::db::Database;

use crate::config::{Config, RemoteSettings, generate_api_key};
use crate::server::{hash_api_key, parse_connect_deep_link};

fn validate_server_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(host) if !host.trim_matches('/').is_empty() => Ok(()),
        _ => bail!("Invalid server URL '{url}'. Expected http://host:port or https://host"),
    }
}

/// Store the backend URL and key used by the sync commands.
///
/// `target` is either the server URL, with `key` given separately, or the
/// `cardsync://connect` link printed by `cardsync serve`.
pub(crate) fn cmd_connect(
    config: &Config,
    target: &str,
    key: Option<&str>,
    json: bool,
) -> Result<()> {
    let (url, key) = if target.trim().starts_with("cardsync://") {
        let Some((url, link_key)) = parse_connect_deep_link(target) else {
            bail!("Invalid connect link. Expected cardsync://connect?url=...&key=...");
        };
        (url, key.map_or(link_key, str::to_string))
    } else {
        let Some(key) = key else {
            bail!("Missing API key. Usage: cardsync connect URL KEY");
        };
        (target.trim().to_string(), key.to_string())
    };
    let url = url.as_str();
    validate_server_url(url)?;
    if key.trim().is_empty() {
        bail!("API key must not be empty");
    }
    let settings = RemoteSettings {
        server_url: Some(url.trim_end_matches('/').to_string()),
        api_key: Some(key.trim().to_string()),
    };
    config.save_remote(&settings)?;

    if json {
        println!("{}", json!({ "server_url": settings.server_url }));
    } else {
        println!(
            "Connected to {}. Run `cardsync sync` to push local edits.",
            settings.server_url.as_deref().unwrap_or(url)
        );
    }
    Ok(())
}

/// Issue a new key for `user` on this backend. Only the hash is stored.
pub(crate) fn cmd_keys_issue(db: &Database, user: &str, json: bool) -> Result<()> {
    let user = user.trim();
    if user.is_empty() {
        bail!("User must not be empty");
    }
    let key = generate_api_key();
    db.register_api_key(&hash_api_key(&key), user)?;

    if json {
        println!("{}", json!({ "user": user, "api_key": key }));
    } else {
        println!("API key for {user}: {key}");
        println!("It is shown only once. Connect with: cardsync connect <server-url> {key}");
    }
    Ok(())
}

pub(crate) fn cmd_keys_revoke(db: &Database, user: &str, json: bool) -> Result<()> {
    let revoked = db.revoke_keys_for_user(user.trim())?;
    if json {
        println!("{}", json!({ "user": user, "revoked": revoked }));
    } else if revoked == 0 {
        println!("No keys found for {user}");
    } else {
        println!("Revoked {revoked} key(s) for {user}");
    }
    Ok(())
}
