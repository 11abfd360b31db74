//! Outbound client messages.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Allow/deny verdict for a tool permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Message sent from the client to the daemon over a session connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubmitTurn {
        content: String,
        client_id: String,
        writer_id: String,
        mode: String,
    },
    #[serde(rename_all = "camelCase")]
    Cancel { writer_id: String },
    #[serde(rename_all = "camelCase")]
    ResolvePermission {
        request_id: String,
        decision: PermissionDecision,
        writer_id: String,
    },
}

impl ClientMessage {
    /// Encode as a wire frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
