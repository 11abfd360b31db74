//! Session records and UI-facing snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Connection state for one session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// One logical conversation with a remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub workspace: String,
    pub title: Option<String>,
    /// Set when the session was created locally because the daemon was
    /// unreachable; the id is client-generated in that case.
    pub offline: bool,
    pub updated_at: DateTime<Utc>,
}

/// Health snapshot for one tracked session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub record: SessionRecord,
    pub connection_state: ConnectionState,
    pub is_streaming: bool,
    pub reconnect_attempts: u32,
    pub next_retry: Option<Duration>,
    pub last_error: Option<String>,
}
