//! Folds the envelope stream into user-visible timeline items.
//!
//! The folder is a pure function of the event sequence plus one piece of
//! merge state per session: the assistant text accumulated from token
//! fragments that has not yet been flushed as a finished item.

use botd_proto::envelope::{PermissionRequestPayload, StreamEvent};
use serde_json::Value;

/// One user-facing unit derived from one or more envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineItem {
    User { text: String },
    Assistant { text: String },
    Thinking { text: String },
    Tool { tool: String, args: String },
    ToolResult { tool: Option<String>, output: String },
    System { text: String },
    Event { kind: String, payload: String },
}

/// Permission traffic extracted by the folder; routed to the arbiter, never
/// to the timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionSignal {
    Requested(PermissionRequestPayload),
    Resolved { request_id: String },
}

/// Side effects of folding one event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FoldOutcome {
    pub items: Vec<TimelineItem>,
    /// `Some` when the event changes the session's streaming flag.
    pub streaming: Option<bool>,
    pub permission: Option<PermissionSignal>,
}

/// Per-session fold state.
#[derive(Debug, Clone)]
pub struct TimelineFolder {
    pending_assistant_text: String,
    render_budget: usize,
}

impl TimelineFolder {
    #[must_use]
    pub fn new(render_budget: usize) -> Self {
        Self {
            pending_assistant_text: String::new(),
            render_budget,
        }
    }

    /// Fold one event. Deterministic for a fixed input sequence; duplicate
    /// envelopes are filtered by seq upstream, so the folder never sees the
    /// same event twice.
    pub fn fold(&mut self, event: &StreamEvent) -> FoldOutcome {
        if let StreamEvent::TokenFragment(payload) = event {
            self.pending_assistant_text.push_str(&payload.text);
            return FoldOutcome::default();
        }

        let mut outcome = FoldOutcome::default();
        if let Some(item) = self.flush_pending() {
            outcome.items.push(item);
        }

        match event {
            StreamEvent::TokenFragment(_) => {}
            StreamEvent::TurnStart => {
                outcome.streaming = Some(true);
            }
            StreamEvent::TurnDone => {
                outcome.items.push(TimelineItem::System {
                    text: "Turn complete".to_string(),
                });
                outcome.streaming = Some(false);
            }
            StreamEvent::TurnError(payload) => {
                outcome.items.push(TimelineItem::System {
                    text: format!("Turn failed: {}", payload.message),
                });
                outcome.streaming = Some(false);
            }
            StreamEvent::SessionCancelled => {
                outcome.items.push(TimelineItem::System {
                    text: "Turn cancelled".to_string(),
                });
                outcome.streaming = Some(false);
            }
            StreamEvent::Thinking(payload) => {
                outcome.items.push(TimelineItem::Thinking {
                    text: payload.text.clone(),
                });
            }
            StreamEvent::ToolStart(payload) => {
                outcome.items.push(TimelineItem::Tool {
                    tool: payload.tool.clone(),
                    args: render_bounded(&payload.args, self.render_budget),
                });
            }
            StreamEvent::ToolEnd(payload) => {
                outcome.items.push(TimelineItem::ToolResult {
                    tool: payload.tool.clone(),
                    output: render_bounded(&payload.output, self.render_budget),
                });
            }
            StreamEvent::PermissionRequest(payload) => {
                outcome.permission = Some(PermissionSignal::Requested(payload.clone()));
            }
            StreamEvent::PermissionResolved(payload) => {
                outcome.permission = Some(PermissionSignal::Resolved {
                    request_id: payload.request_id.clone(),
                });
            }
            StreamEvent::Heartbeat => {}
            StreamEvent::Unknown { kind, payload } => {
                outcome.items.push(TimelineItem::Event {
                    kind: kind.clone(),
                    payload: render_bounded(payload, self.render_budget),
                });
            }
        }

        outcome
    }

    /// Flush accumulated fragments as one assistant item, if any.
    pub fn flush_pending(&mut self) -> Option<TimelineItem> {
        if self.pending_assistant_text.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.pending_assistant_text);
        Some(TimelineItem::Assistant { text })
    }
}

/// Bounded rendering of a structured value for display. Truncation is a
/// display concern only; the full payload stays in the event log.
fn render_bounded(value: &Value, budget: usize) -> String {
    let rendered = match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() <= budget {
        return rendered;
    }
    let mut truncated: String = rendered.chars().take(budget).collect();
    truncated.push('…');
    truncated
}
