//! Outstanding tool-permission requests for one session.

use botd_proto::envelope::PermissionRequestPayload;
use serde_json::Value;

/// One open pause-and-ask handshake from the remote agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub tool: String,
    pub args: Value,
}

/// Tracks the open set and correlates resolutions back to requests.
/// Resolution is idempotent: resolving an unknown or already-resolved
/// request id is a no-op, never an error.
#[derive(Debug, Clone, Default)]
pub struct PermissionArbiter {
    open: Vec<PermissionRequest>,
}

impl PermissionArbiter {
    /// Track an incoming request. Duplicate delivery of the same request id
    /// is ignored. Returns whether the open set changed.
    pub fn on_request(&mut self, session_id: &str, payload: &PermissionRequestPayload) -> bool {
        if self
            .open
            .iter()
            .any(|request| request.request_id == payload.request_id)
        {
            return false;
        }
        self.open.push(PermissionRequest {
            request_id: payload.request_id.clone(),
            session_id: session_id.to_string(),
            tool: payload.tool.clone(),
            args: payload.args.clone(),
        });
        true
    }

    /// Remove a request from the open set, whatever the origin of the
    /// resolution. Returns the request if it was open.
    pub fn resolve(&mut self, request_id: &str) -> Option<PermissionRequest> {
        let position = self
            .open
            .iter()
            .position(|request| request.request_id == request_id)?;
        Some(self.open.remove(position))
    }

    #[must_use]
    pub fn open(&self) -> &[PermissionRequest] {
        &self.open
    }
}
