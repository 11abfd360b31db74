//! Synchronizer configuration.

use std::time::Duration;

/// Where the daemon lives. The websocket URL carries per-session streams,
/// the HTTP URL carries session creation and the out-of-band health probe.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ws_url: String,
    pub http_url: String,
    pub auth_token: Option<String>,
}

impl Endpoint {
    #[must_use]
    pub fn new(ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            http_url: http_url.into(),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Per-connection transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Dial timeout for one connection attempt. Kept below the backoff base
    /// delay so a hung dial cannot stall the reconnect schedule.
    pub dial_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_millis(900),
        }
    }
}

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub endpoint: Endpoint,
    /// Identity of this client installation.
    pub client_id: String,
    /// Writer identity attached to outbound turns and resolutions.
    pub writer_id: String,
    /// Turn mode used when a submit does not name one.
    pub default_mode: String,
    pub transport: TransportConfig,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Attempt index past which the delay stays at the cap.
    pub backoff_attempt_ceiling: u32,
    /// Character budget for tool argument/output renderings.
    pub render_budget: usize,
    pub health_poll_interval: Duration,
    pub health_probe_timeout: Duration,
    /// Bound on session-creation requests; past it the session is created
    /// locally and marked offline.
    pub http_request_timeout: Duration,
}

impl SyncConfig {
    #[must_use]
    pub fn new(endpoint: Endpoint, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            endpoint,
            writer_id: client_id.clone(),
            client_id,
            default_mode: "chat".to_string(),
            transport: TransportConfig::default(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            backoff_attempt_ceiling: 10,
            render_budget: 500,
            health_poll_interval: Duration::from_secs(15),
            health_probe_timeout: Duration::from_secs(2),
            http_request_timeout: Duration::from_secs(5),
        }
    }
}
