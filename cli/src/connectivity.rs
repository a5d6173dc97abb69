use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use cardsync_core::connectivity::Connectivity;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Considers the backend reachable when `GET /api/health` answers 2xx.
pub struct HttpConnectivity {
    client: reqwest::Client,
    health_url: String,
}

impl HttpConnectivity {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            health_url: format!("{}/api/health", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Connectivity for HttpConnectivity {
    async fn is_online(&self) -> bool {
        match self.client.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %self.health_url, error = %e, "health probe failed");
                false
            }
        }
    }
}
