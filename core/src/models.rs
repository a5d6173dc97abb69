use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::record::SyncRecord;

pub const MAX_SHORT_FIELD: usize = 200;
pub const MAX_BIO: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub company: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_logo: Option<String>,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub social: BTreeMap<String, String>,
    #[serde(default)]
    pub contact: ContactInfo,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    Light,
    Dark,
}

impl std::str::FromStr for ThemeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            _ => bail!("Invalid theme mode '{s}'. Must be one of: light, dark"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
    pub primary: String,
    pub secondary: String,
    #[serde(default)]
    pub mode: ThemeMode,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            primary: "#1F2937".to_string(),
            secondary: "#3B82F6".to_string(),
            mode: ThemeMode::Light,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

/// Maps an explicit JSON `null` to `Some(None)` so it can be told apart from an
/// absent field (`None`).
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Partial update of a [`Profile`].
///
/// Absent fields are preserved. For optional profile fields the patch holds an
/// `Option<Option<_>>`: `Some(None)` (JSON `null`) clears the field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::option_option)]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub bio: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub company_logo: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<ThemePatch>,
    /// Per-network changes; `None` removes the link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social: Option<BTreeMap<String, Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ThemeMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::option_option)]
pub struct ContactPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub website: Option<Option<String>>,
    /// Replaces the whole address when present.
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub address: Option<Option<Address>>,
}

impl ProfilePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn patch_field<T: Clone>(target: &mut T, value: Option<&T>) {
    if let Some(v) = value {
        *target = v.clone();
    }
}

impl Theme {
    fn apply(&mut self, patch: &ThemePatch) {
        patch_field(&mut self.primary, patch.primary.as_ref());
        patch_field(&mut self.secondary, patch.secondary.as_ref());
        patch_field(&mut self.mode, patch.mode.as_ref());
    }
}

impl ContactInfo {
    fn apply(&mut self, patch: &ContactPatch) {
        patch_field(&mut self.email, patch.email.as_ref());
        patch_field(&mut self.phone, patch.phone.as_ref());
        patch_field(&mut self.website, patch.website.as_ref());
        patch_field(&mut self.address, patch.address.as_ref());
    }
}

impl SyncRecord for Profile {
    type Patch = ProfilePatch;

    const CACHE_KEY: &'static str = "offline_profile";

    fn blank(now: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: String::new(),
            name: String::new(),
            title: String::new(),
            bio: None,
            avatar: None,
            company: String::new(),
            company_logo: None,
            theme: Theme::default(),
            social: BTreeMap::new(),
            contact: ContactInfo::default(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, patch: &ProfilePatch) {
        patch_field(&mut self.name, patch.name.as_ref());
        patch_field(&mut self.title, patch.title.as_ref());
        patch_field(&mut self.bio, patch.bio.as_ref());
        patch_field(&mut self.avatar, patch.avatar.as_ref());
        patch_field(&mut self.company, patch.company.as_ref());
        patch_field(&mut self.company_logo, patch.company_logo.as_ref());
        if let Some(ref theme) = patch.theme {
            self.theme.apply(theme);
        }
        if let Some(ref social) = patch.social {
            for (network, url) in social {
                match url {
                    Some(url) => {
                        self.social.insert(network.clone(), url.clone());
                    }
                    None => {
                        self.social.remove(network);
                    }
                }
            }
        }
        if let Some(ref contact) = patch.contact {
            self.contact.apply(contact);
        }
    }

    fn touch(&mut self, now: &str) {
        self.updated_at = now.to_string();
    }
}

// --- Validation ---

fn validate_length(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len > max {
        bail!("{field} must be at most {max} characters (got {len})");
    }
    Ok(())
}

fn validate_hex_color(field: &str, value: &str) -> Result<()> {
    let valid = value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        bail!("{field} must be a #RRGGBB color (got '{value}')");
    }
    Ok(())
}

fn validate_timestamp(field: &str, value: &str) -> Result<()> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map_err(|_| anyhow::anyhow!("Invalid {field} '{value}'. Must be RFC 3339 format"))?;
    Ok(())
}

/// Validate a profile received from a client before it is stored.
pub fn validate_profile(profile: &Profile) -> Result<()> {
    if profile.id.trim().is_empty() {
        bail!("Profile id must not be empty");
    }
    validate_length("name", &profile.name, MAX_SHORT_FIELD)?;
    validate_length("title", &profile.title, MAX_SHORT_FIELD)?;
    validate_length("company", &profile.company, MAX_SHORT_FIELD)?;
    if let Some(ref bio) = profile.bio {
        validate_length("bio", bio, MAX_BIO)?;
    }
    validate_hex_color("theme.primary", &profile.theme.primary)?;
    validate_hex_color("theme.secondary", &profile.theme.secondary)?;
    let email = profile.contact.email.trim();
    if !email.is_empty() && !email.contains('@') {
        bail!("contact.email '{email}' is not a valid email address");
    }
    validate_timestamp("created_at", &profile.created_at)?;
    validate_timestamp("updated_at", &profile.updated_at)?;
    Ok(())
}
