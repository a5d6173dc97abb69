mod commands;
mod config;
mod connectivity;
mod remote;
mod server;

use std::process;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cardsync_core::cache::SqliteCache;
use cardsync_core::connectivity::{Connectivity, StaticConnectivity};
use cardsync_core::db::Database;
use cardsync_core::models::{Profile, ThemeMode};
use cardsync_core::remote::RemoteStore;
use cardsync_core::store::{StoreConfig, SyncedRecordStore};

use crate::commands::{
    ProfileEdit, ProfileStore, cmd_connect, cmd_keys_issue, cmd_keys_revoke, cmd_profile_set,
    cmd_profile_show, cmd_reset, cmd_status, cmd_sync,
};
use crate::config::{Config, RemoteSettings};
use crate::connectivity::HttpConnectivity;
use crate::remote::{DisconnectedRemote, HttpProfileRemote};

#[derive(Parser)]
#[command(
    name = "cardsync",
    version,
    about = "Your digital business card, editable offline",
    long_about = "Edit your business card profile offline and sync it to your backend.\n\
                  Edits are saved locally first and pushed when the server is reachable."
)]
struct Cli {
    /// Backend URL (overrides the one saved by `connect`)
    #[arg(long, global = true)]
    server: Option<String>,
    /// API key (overrides the one saved by `connect`)
    #[arg(long, global = true)]
    api_key: Option<String>,
    /// Do not contact the backend
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or edit your profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Show local sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push pending local edits to the backend
    Sync {
        /// Keep running and sync whenever the backend becomes reachable
        #[arg(long)]
        watch: bool,
        /// Connectivity poll interval in seconds (with --watch)
        #[arg(long, default_value = "30")]
        interval: u64,
    },
    /// Sign out: forget the profile and purge the local cache
    Reset {
        /// Discard local edits that were never synced
        #[arg(long)]
        force: bool,
    },
    /// Save the backend URL and API key
    Connect {
        /// Backend URL (e.g. http://192.168.1.10:8080), or the cardsync://connect
        /// link printed by `serve`
        url: String,
        /// API key issued by the backend (not needed with a connect link)
        key: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the REST backend
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
    /// Manage backend API keys
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the profile (refreshed from the backend when online)
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit profile fields; omitted fields are kept
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long, conflicts_with = "clear_bio")]
        bio: Option<String>,
        /// Remove the bio
        #[arg(long)]
        clear_bio: bool,
        /// Avatar image URL
        #[arg(long)]
        avatar: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        website: Option<String>,
        /// Primary theme color (#RRGGBB)
        #[arg(long)]
        primary: Option<String>,
        /// Secondary theme color (#RRGGBB)
        #[arg(long)]
        secondary: Option<String>,
        /// Theme mode: light, dark
        #[arg(long)]
        mode: Option<ThemeMode>,
        /// Social link as network=url (repeatable)
        #[arg(long, value_name = "NETWORK=URL")]
        social: Vec<String>,
        /// Remove a social link (repeatable)
        #[arg(long, value_name = "NETWORK")]
        remove_social: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Issue an API key for a user
    Issue {
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Revoke all API keys of a user
    Revoke {
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Wire the profile store to the local cache and the configured backend.
fn build_store(
    config: &Config,
    remote: &RemoteSettings,
    offline: bool,
) -> Result<(ProfileStore, Arc<dyn Connectivity>)> {
    let cache = Arc::new(SqliteCache::open(&config.cache_path)?);

    let remote_store: Arc<dyn RemoteStore<Profile>>;
    let connectivity: Arc<dyn Connectivity>;
    match remote.server_url {
        Some(ref url) if !offline => {
            remote_store = Arc::new(HttpProfileRemote::new(url, remote.api_key.clone())?);
            connectivity = Arc::new(HttpConnectivity::new(url)?);
        }
        _ => {
            remote_store = Arc::new(DisconnectedRemote);
            connectivity = Arc::new(StaticConnectivity::new(false));
        }
    }

    let store = SyncedRecordStore::new(
        remote_store,
        cache,
        connectivity.clone(),
        StoreConfig::default(),
    );
    Ok((store, connectivity))
}

/// `sync` needs a backend to talk to; `--watch` would otherwise poll forever.
fn check_sync_target(remote: &RemoteSettings, offline: bool, watch: bool) -> Result<()> {
    if remote.server_url.is_none() {
        bail!("No server configured. Run `cardsync connect URL KEY` first");
    }
    if offline && watch {
        bail!("--watch cannot be combined with --offline");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    let mut remote = config.load_remote()?;
    if cli.server.is_some() {
        remote.server_url = cli.server;
    }
    if cli.api_key.is_some() {
        remote.api_key = cli.api_key;
    }

    match cli.command {
        Commands::Profile { command } => {
            let (store, _) = build_store(&config, &remote, cli.offline)?;
            match command {
                ProfileCommands::Show { json } => cmd_profile_show(&store, json).await,
                ProfileCommands::Set {
                    name,
                    title,
                    company,
                    bio,
                    clear_bio,
                    avatar,
                    email,
                    phone,
                    website,
                    primary,
                    secondary,
                    mode,
                    social,
                    remove_social,
                    json,
                } => {
                    let edit = ProfileEdit {
                        name,
                        title,
                        company,
                        bio,
                        clear_bio,
                        avatar,
                        email,
                        phone,
                        website,
                        primary,
                        secondary,
                        mode,
                        social,
                        remove_social,
                    };
                    cmd_profile_set(&store, edit, json).await
                }
            }
        }
        Commands::Status { json } => {
            let (store, connectivity) = build_store(&config, &remote, cli.offline)?;
            cmd_status(
                &store,
                connectivity.as_ref(),
                remote.server_url.as_deref(),
                json,
            )
            .await
        }
        Commands::Sync { watch, interval } => {
            check_sync_target(&remote, cli.offline, watch)?;
            let (store, connectivity) = build_store(&config, &remote, cli.offline)?;
            cmd_sync(&store, connectivity.as_ref(), watch, interval).await
        }
        Commands::Reset { force } => {
            let (store, _) = build_store(&config, &remote, true)?;
            cmd_reset(&store, force)
        }
        Commands::Connect { url, key, json } => {
            cmd_connect(&config, &url, key.as_deref(), json)
        }
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let db = Database::open(&config.server_db_path)?;
            let (owner_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            server::start_server(db, port, &bind, owner_key, new_api_key).await
        }
        Commands::Keys { command } => {
            let db = Database::open(&config.server_db_path)?;
            match command {
                KeyCommands::Issue { user, json } => cmd_keys_issue(&db, &user, json),
                KeyCommands::Revoke { user, json } => cmd_keys_revoke(&db, &user, json),
            }
        }
    }
}
