//! Inbound envelope decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, Result};

/// One sequenced unit of daemon traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub seq: u64,
    pub event: StreamEvent,
}

/// Typed payload for each recognized event kind, plus a catch-all for
/// kinds this client does not know about yet.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TurnStart,
    TokenFragment(TokenFragmentPayload),
    Thinking(ThinkingPayload),
    ToolStart(ToolStartPayload),
    ToolEnd(ToolEndPayload),
    TurnDone,
    TurnError(TurnErrorPayload),
    SessionCancelled,
    PermissionRequest(PermissionRequestPayload),
    PermissionResolved(PermissionResolvedPayload),
    Heartbeat,
    Unknown { kind: String, payload: Value },
}

impl StreamEvent {
    /// Wire kind string for this event.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::TurnStart => "turn-start",
            Self::TokenFragment(_) => "token-fragment",
            Self::Thinking(_) => "thinking",
            Self::ToolStart(_) => "tool-start",
            Self::ToolEnd(_) => "tool-end",
            Self::TurnDone => "turn-done",
            Self::TurnError(_) => "turn-error",
            Self::SessionCancelled => "session-cancelled",
            Self::PermissionRequest(_) => "permission-request",
            Self::PermissionResolved(_) => "permission-resolved",
            Self::Heartbeat => "heartbeat",
            Self::Unknown { kind, .. } => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenFragmentPayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingPayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStartPayload {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEndPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestPayload {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResolvedPayload {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

/// Decode one wire frame into a typed envelope.
///
/// Unknown event kinds succeed and carry their raw payload; structural
/// problems (not an object, missing kind or seq, payload of the wrong shape
/// for a recognized kind) are errors the caller is expected to drop.
pub fn decode_envelope(text: &str) -> Result<Envelope> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| ProtoError::Shape("expected JSON object envelope".to_string()))?;

    let kind = object
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtoError::Shape("missing envelope event kind".to_string()))?;
    let seq = object
        .get("seq")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtoError::Shape("missing envelope seq".to_string()))?;
    let payload = object.get("payload").cloned().unwrap_or(Value::Null);

    let event = match kind {
        "turn-start" => StreamEvent::TurnStart,
        "token-fragment" => StreamEvent::TokenFragment(decode_payload(kind, payload)?),
        "thinking" => StreamEvent::Thinking(decode_payload(kind, payload)?),
        "tool-start" => StreamEvent::ToolStart(decode_payload(kind, payload)?),
        "tool-end" => StreamEvent::ToolEnd(decode_payload(kind, payload)?),
        "turn-done" => StreamEvent::TurnDone,
        "turn-error" => StreamEvent::TurnError(decode_payload(kind, payload)?),
        "session-cancelled" => StreamEvent::SessionCancelled,
        "permission-request" => StreamEvent::PermissionRequest(decode_payload(kind, payload)?),
        "permission-resolved" => StreamEvent::PermissionResolved(decode_payload(kind, payload)?),
        "heartbeat" | "ping" => StreamEvent::Heartbeat,
        other => StreamEvent::Unknown {
            kind: other.to_string(),
            payload,
        },
    };

    Ok(Envelope { seq, event })
}

fn decode_payload<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|error| ProtoError::Shape(format!("invalid {kind} payload: {error}")))
}
