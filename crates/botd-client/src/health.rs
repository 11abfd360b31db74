//! Out-of-band daemon reachability probe.
//!
//! Independent of any session stream: a session can be disconnected while
//! the daemon itself is fine, and vice versa.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::config::Endpoint;
use crate::error::{ClientError, Result};
use crate::sync::SyncUpdate;

/// Last known daemon reachability.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DaemonHealth {
    pub reachable: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Probes the daemon's health endpoint.
pub struct HealthClient {
    http: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    probe_timeout: Duration,
}

impl HealthClient {
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: &Endpoint, probe_timeout: Duration) -> Self {
        Self {
            http,
            url: health_url(endpoint),
            auth_token: endpoint.auth_token.clone(),
            probe_timeout,
        }
    }

    /// One bounded probe. Any failure means unreachable.
    pub async fn probe(&self) -> Result<()> {
        let mut request = self.http.get(&self.url).timeout(self.probe_timeout);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|error| ClientError::Http(error.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Http(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }
}

fn health_url(endpoint: &Endpoint) -> String {
    format!("{}/v1/health", endpoint.http_url.trim_end_matches('/'))
}

/// Poll forever, publishing reachability flips to the update channel.
pub(crate) async fn run_health_poller(
    client: HealthClient,
    interval: Duration,
    state: Arc<RwLock<DaemonHealth>>,
    updates: mpsc::UnboundedSender<SyncUpdate>,
) {
    loop {
        let result = client.probe().await;
        let next = DaemonHealth {
            reachable: result.is_ok(),
            checked_at: Some(Utc::now()),
            last_error: result.err().map(|error| error.to_string()),
        };
        let flipped = {
            let mut current = state.write().await;
            let flipped = current.reachable != next.reachable;
            *current = next;
            flipped
        };
        if flipped {
            debug!("daemon reachability changed");
            let _ = updates.send(SyncUpdate::HealthChanged);
        }
        tokio::time::sleep(interval).await;
    }
}
