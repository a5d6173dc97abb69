use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use cardsync_core::models::Profile;
use cardsync_core::remote::{RemoteStore, SyncError};

const PROFILE_PATH: &str = "/api/profile";

/// [`RemoteStore`] backed by a `cardsync serve` backend.
pub struct HttpProfileRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpProfileRemote {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("cardsync/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn error_from_response(response: reqwest::Response) -> SyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }
}

/// Map a non-success HTTP status to a sync error class.
///
/// Server faults, 408 and 429 are worth retrying; other client errors mean
/// the payload or credentials were rejected.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .ok()
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()));
    let message = match detail {
        Some(detail) => format!("Server returned {status}: {detail}"),
        None => format!("Server returned {status}"),
    };
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        SyncError::Transient(message)
    } else {
        SyncError::Permanent(message)
    }
}

fn transport_error(err: &reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::permanent(format!("Invalid response from server: {err}"))
    } else {
        SyncError::transient(format!("Failed to reach server: {err}"))
    }
}

#[async_trait]
impl RemoteStore<Profile> for HttpProfileRemote {
    async fn fetch_one(&self) -> Result<Option<Profile>, SyncError> {
        let response = self
            .authorized(self.client.get(self.url(PROFILE_PATH)))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let profile = response
                    .json::<Profile>()
                    .await
                    .map_err(|e| transport_error(&e))?;
                Ok(Some(profile))
            }
            _ => Err(Self::error_from_response(response).await),
        }
    }

    async fn upsert(&self, record: &Profile) -> Result<(), SyncError> {
        let response = self
            .authorized(self.client.put(self.url(PROFILE_PATH)))
            .json(record)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response).await)
        }
    }
}

/// Stand-in when no backend is configured; edits stay local.
pub struct DisconnectedRemote;

#[async_trait]
impl RemoteStore<Profile> for DisconnectedRemote {
    async fn fetch_one(&self) -> Result<Option<Profile>, SyncError> {
        Err(not_connected())
    }

    async fn upsert(&self, _record: &Profile) -> Result<(), SyncError> {
        Err(not_connected())
    }
}

fn not_connected() -> SyncError {
    SyncError::transient("No server configured. Run `cardsync connect URL KEY`")
}
