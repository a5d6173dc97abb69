use tabled::{
    Table, Tabled,
    settings::{Style, Width, object::Columns},
};

use cardsync_core::models::Profile;
use cardsync_core::record::SyncState;

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn row(field: &str, value: impl Into<String>) -> FieldRow {
    FieldRow {
        field: field.to_string(),
        value: value.into(),
    }
}

/// Key/value rows for a profile, skipping empty optional fields.
fn profile_rows(profile: &Profile) -> Vec<FieldRow> {
    let mut rows = vec![
        row("Name", profile.name.as_str()),
        row("Title", profile.title.as_str()),
        row("Company", profile.company.as_str()),
    ];
    if let Some(ref bio) = profile.bio {
        rows.push(row("Bio", truncate(bio, 60)));
    }
    if let Some(ref avatar) = profile.avatar {
        rows.push(row("Avatar", truncate(avatar, 60)));
    }
    if !profile.contact.email.is_empty() {
        rows.push(row("Email", profile.contact.email.as_str()));
    }
    if !profile.contact.phone.is_empty() {
        rows.push(row("Phone", profile.contact.phone.as_str()));
    }
    if let Some(ref website) = profile.contact.website {
        rows.push(row("Website", website.as_str()));
    }
    for (network, url) in &profile.social {
        rows.push(row(network, url.as_str()));
    }
    rows.push(row(
        "Theme",
        format!(
            "{} / {} ({:?})",
            profile.theme.primary, profile.theme.secondary, profile.theme.mode
        )
        .to_lowercase(),
    ));
    rows.push(row("Updated", profile.updated_at.as_str()));
    rows
}

pub(crate) fn print_profile(profile: &Profile, sync_state: SyncState) {
    let table = Table::new(profile_rows(profile))
        .with(Style::rounded())
        .with(tabled::settings::Modify::new(Columns::single(1)).with(Width::wrap(60)))
        .to_string();
    println!("{table}");
    println!("Sync: {sync_state}");
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
