use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};

use cardsync_core::models::{ContactPatch, ProfilePatch, ThemeMode, ThemePatch};
use cardsync_core::remote::SyncError;
use cardsync_core::store::SyncOutcome;

use super::ProfileStore;
use super::helpers::print_profile;

/// Field edits collected from `profile set` flags.
#[derive(Debug, Default)]
pub(crate) struct ProfileEdit {
    pub name: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub bio: Option<String>,
    pub clear_bio: bool,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub mode: Option<ThemeMode>,
    /// `network=url` entries.
    pub social: Vec<String>,
    pub remove_social: Vec<String>,
}

fn parse_social(entry: &str) -> Result<(String, String)> {
    let (network, url) = entry
        .split_once('=')
        .with_context(|| format!("Invalid social link '{entry}'. Use network=url"))?;
    let network = network.trim().to_lowercase();
    let url = url.trim();
    if network.is_empty() || url.is_empty() {
        bail!("Invalid social link '{entry}'. Use network=url");
    }
    Ok((network, url.to_string()))
}

impl ProfileEdit {
    pub(crate) fn into_patch(self) -> Result<ProfilePatch> {
        if self.bio.is_some() && self.clear_bio {
            bail!("--bio and --clear-bio cannot be used together");
        }

        let bio = if self.clear_bio {
            Some(None)
        } else {
            self.bio.map(Some)
        };

        let theme = (self.primary.is_some() || self.secondary.is_some() || self.mode.is_some())
            .then(|| ThemePatch {
                primary: self.primary,
                secondary: self.secondary,
                mode: self.mode,
            });

        let contact = (self.email.is_some() || self.phone.is_some() || self.website.is_some())
            .then(|| ContactPatch {
                email: self.email,
                phone: self.phone,
                website: self.website.map(Some),
                address: None,
            });

        let mut social: BTreeMap<String, Option<String>> = BTreeMap::new();
        for entry in &self.social {
            let (network, url) = parse_social(entry)?;
            social.insert(network, Some(url));
        }
        for network in &self.remove_social {
            social.insert(network.trim().to_lowercase(), None);
        }

        let patch = ProfilePatch {
            name: self.name,
            title: self.title,
            bio,
            avatar: self.avatar.map(Some),
            company: self.company,
            company_logo: None,
            theme,
            social: (!social.is_empty()).then_some(social),
            contact,
        };
        if patch.is_empty() {
            bail!("Nothing to update. Pass at least one field, e.g. --name \"Ada Lovelace\"");
        }
        Ok(patch)
    }
}

pub(crate) async fn cmd_profile_show(store: &ProfileStore, json: bool) -> Result<()> {
    store.restore();
    if let Err(e) = store.fetch().await {
        eprintln!("Warning: could not refresh from server ({e}); showing local copy");
    }

    let Some(profile) = store.record() else {
        if json {
            println!("null");
        } else {
            println!("No profile yet. Create one with `cardsync profile set --name ...`");
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        print_profile(&profile, store.sync_state());
    }
    Ok(())
}

pub(crate) async fn cmd_profile_set(
    store: &ProfileStore,
    edit: ProfileEdit,
    json: bool,
) -> Result<()> {
    let patch = edit.into_patch()?;
    store.restore();
    // Edit the profile the backend already has, not a blank one under a new id.
    if store.record().is_none() {
        if let Err(e) = store.fetch().await {
            eprintln!("Warning: could not load profile from server ({e}); starting a new one");
        }
    }
    let outcome = store.update(patch).await;
    let profile = store.record().context("Profile missing after update")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        print_profile(&profile, store.sync_state());
    }

    match outcome {
        Ok(SyncOutcome::Synced) => eprintln!("Saved and synced."),
        Ok(SyncOutcome::Deferred) => {
            eprintln!("Saved locally (offline). Run `cardsync sync` when back online.");
        }
        Ok(_) => eprintln!("Saved locally. Run `cardsync sync` to push it."),
        Err(SyncError::Transient(msg)) => {
            eprintln!("Saved locally, but sync failed: {msg}. It will be retried by `cardsync sync`.");
        }
        Err(e @ SyncError::Permanent(_)) => {
            return Err(e).context("Saved locally, but the server rejected the change");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_edit_rejected() {
        let err = ProfileEdit::default().into_patch().unwrap_err();
        assert!(err.to_string().contains("Nothing to update"));
    }

    #[test]
    fn test_edit_to_patch() {
        let patch = ProfileEdit {
            name: Some("Ada".to_string()),
            primary: Some("#000000".to_string()),
            email: Some("ada@example.com".to_string()),
            social: vec!["GitHub=https://github.com/ada".to_string()],
            remove_social: vec!["twitter".to_string()],
            ..Default::default()
        }
        .into_patch()
        .unwrap();

        assert_eq!(patch.name.as_deref(), Some("Ada"));
        assert!(patch.title.is_none());
        assert!(patch.bio.is_none());
        let theme = patch.theme.unwrap();
        assert_eq!(theme.primary.as_deref(), Some("#000000"));
        assert!(theme.secondary.is_none());
        let contact = patch.contact.unwrap();
        assert_eq!(contact.email.as_deref(), Some("ada@example.com"));
        assert!(contact.website.is_none());
        let social = patch.social.unwrap();
        assert_eq!(
            social.get("github"),
            Some(&Some("https://github.com/ada".to_string()))
        );
        assert_eq!(social.get("twitter"), Some(&None));
    }

    #[test]
    fn test_clear_bio() {
        let patch = ProfileEdit {
            clear_bio: true,
            ..Default::default()
        }
        .into_patch()
        .unwrap();
        assert_eq!(patch.bio, Some(None));

        let err = ProfileEdit {
            bio: Some("x".to_string()),
            clear_bio: true,
            ..Default::default()
        }
        .into_patch()
        .unwrap_err();
        assert!(err.to_string().contains("cannot be used together"));
    }

    #[test]
    fn test_parse_social_invalid() {
        assert!(parse_social("github").is_err());
        assert!(parse_social("=https://x").is_err());
        assert!(parse_social("github=").is_err());
        assert_eq!(
            parse_social(" LinkedIn = https://linkedin.com/in/ada ").unwrap(),
            (
                "linkedin".to_string(),
                "https://linkedin.com/in/ada".to_string()
            )
        );
    }
}
