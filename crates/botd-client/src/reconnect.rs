//! Per-session subscription lifecycle.
//!
//! One controller per tracked session: connect, resume from the cursor,
//! pump events, classify the close, back off, retry. Transport failures are
//! contained here and never surfaced to the caller; only a protocol-level
//! rejection is terminal. All transitions run through [`Lifecycle`], which
//! is pure and tested without timers.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use botd_proto::decode_envelope;
use botd_proto::envelope::Envelope;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::error::ClientError;
use crate::eventlog::EventLog;
use crate::permissions::PermissionArbiter;
use crate::session::{ConnectionState, SessionRecord};
use crate::sync::SyncUpdate;
use crate::timeline::{PermissionSignal, TimelineFolder, TimelineItem};
use crate::transport::{CloseReason, SessionTransport, TransportEvent, TransportHandle};

/// Controller state machine. `Idle` is terminal once reached via `stop` or a
/// graceful/rejected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Connecting,
    Open,
    Backoff,
}

impl ControllerState {
    /// UI-facing connection state for this controller state.
    #[must_use]
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Disconnected,
            Self::Connecting | Self::Backoff => ConnectionState::Connecting,
            Self::Open => ConnectionState::Connected,
        }
    }
}

/// What to do after a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// `Some(delay)` schedules a reconnect; `None` means the controller
    /// stays down.
    pub reconnect_after: Option<Duration>,
    /// Set for protocol rejections: surfaced once, no auto-retry.
    pub terminal_error: Option<String>,
}

/// Pure transition core for one controller.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    base: Duration,
    cap: Duration,
    attempt_ceiling: u32,
    state: ControllerState,
    attempts: u32,
}

impl Lifecycle {
    #[must_use]
    pub fn new(base: Duration, cap: Duration, attempt_ceiling: u32) -> Self {
        Self {
            base,
            cap,
            attempt_ceiling,
            state: ControllerState::Idle,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.backoff_base,
            config.backoff_cap,
            config.backoff_attempt_ceiling,
        )
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn mark_connecting(&mut self) {
        self.state = ControllerState::Connecting;
    }

    /// Connection established: the attempt counter resets.
    pub fn mark_open(&mut self) {
        self.state = ControllerState::Open;
        self.attempts = 0;
    }

    /// Explicit teardown. Terminal.
    pub fn mark_stopped(&mut self) {
        self.state = ControllerState::Idle;
    }

    /// Classify a close and plan what follows.
    pub fn mark_closed(&mut self, reason: &CloseReason) -> ReconnectPlan {
        match reason {
            CloseReason::Graceful => {
                self.state = ControllerState::Idle;
                ReconnectPlan {
                    reconnect_after: None,
                    terminal_error: None,
                }
            }
            CloseReason::Rejected(message) => {
                self.state = ControllerState::Idle;
                ReconnectPlan {
                    reconnect_after: None,
                    terminal_error: Some(message.clone()),
                }
            }
            CloseReason::Abnormal(_) => {
                let delay = backoff_delay(self.base, self.cap, self.attempt_ceiling, self.attempts);
                self.attempts = self.attempts.saturating_add(1);
                self.state = ControllerState::Backoff;
                ReconnectPlan {
                    reconnect_after: Some(delay),
                    terminal_error: None,
                }
            }
        }
    }
}

/// `min(base * 2^attempt, cap)`, with the exponent clamped at the ceiling.
#[must_use]
pub fn backoff_delay(base: Duration, cap: Duration, attempt_ceiling: u32, attempt: u32) -> Duration {
    let exponent = attempt.min(attempt_ceiling).min(31);
    base.saturating_mul(1_u32 << exponent).min(cap)
}

/// A failed connection attempt is a rejection only when the daemon refused
/// us at the protocol level; everything else drives backoff.
#[must_use]
pub fn classify_connect_failure(error: &ClientError) -> CloseReason {
    let rendered = error.to_string();
    let normalized = rendered.to_ascii_lowercase();
    if normalized.contains("status=401")
        || normalized.contains("status=403")
        || normalized.contains("unauthorized")
        || normalized.contains("forbidden")
    {
        return CloseReason::Rejected(rendered);
    }
    CloseReason::Abnormal(rendered)
}

/// Mutable per-session state. Single writer per key: the controller task and
/// the command surface both go through the containing lock.
pub(crate) struct SessionState {
    pub record: SessionRecord,
    pub lifecycle: Lifecycle,
    pub is_streaming: bool,
    pub timeline: Vec<TimelineItem>,
    pub folder: TimelineFolder,
    pub arbiter: PermissionArbiter,
    pub next_retry: Option<Duration>,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn new(record: SessionRecord, config: &SyncConfig) -> Self {
        Self {
            record,
            lifecycle: Lifecycle::from_config(config),
            is_streaming: false,
            timeline: Vec::new(),
            folder: TimelineFolder::new(config.render_budget),
            arbiter: PermissionArbiter::default(),
            next_retry: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.state().connection_state()
    }
}

/// Shared per-session handle: state, resume cursor, closing flag, writer.
pub(crate) struct SessionShared {
    pub state: Mutex<SessionState>,
    pub cursor: AtomicU64,
    pub closing: AtomicBool,
    pub writer: Mutex<Option<Box<dyn TransportHandle>>>,
}

impl SessionShared {
    pub fn new(state: SessionState, cursor: u64) -> Self {
        Self {
            state: Mutex::new(state),
            cursor: AtomicU64::new(cursor),
            closing: AtomicBool::new(false),
            writer: Mutex::new(None),
        }
    }
}

/// Everything the apply path needs for one session.
#[derive(Clone)]
pub(crate) struct SessionCtx {
    pub session_id: String,
    pub shared: Arc<SessionShared>,
    pub cursors: Arc<StdMutex<CursorStore>>,
    pub updates: mpsc::UnboundedSender<SyncUpdate>,
}

impl SessionCtx {
    pub fn notify(&self, update: SyncUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Everything the controller task needs.
pub(crate) struct ControllerContext {
    pub session: SessionCtx,
    pub config: SyncConfig,
    pub transport: Arc<dyn SessionTransport>,
    pub event_log: Arc<dyn EventLog>,
}

enum PumpEnd {
    Closing,
    Closed(CloseReason),
}

/// Run one session's subscription until stopped or terminally closed.
pub(crate) async fn run_controller(ctx: ControllerContext) {
    let session_id = ctx.session.session_id.clone();
    loop {
        if ctx.session.shared.closing.load(Ordering::Acquire) {
            return;
        }

        {
            let mut state = ctx.session.shared.state.lock().await;
            state.lifecycle.mark_connecting();
            state.next_retry = None;
        }
        ctx.session
            .notify(SyncUpdate::ConnectionChanged(session_id.clone()));

        let after_seq = ctx.session.shared.cursor.load(Ordering::Acquire);
        debug!("connecting session {} after seq {}", session_id, after_seq);

        let close_reason = match ctx
            .transport
            .connect(&ctx.config.endpoint, &session_id, after_seq)
            .await
        {
            Ok(connection) => {
                *ctx.session.shared.writer.lock().await = Some(connection.handle);
                let end = pump_events(&ctx, connection.events).await;
                ctx.session.shared.writer.lock().await.take();
                match end {
                    PumpEnd::Closing => return,
                    PumpEnd::Closed(reason) => reason,
                }
            }
            Err(error) => classify_connect_failure(&error),
        };

        if ctx.session.shared.closing.load(Ordering::Acquire) {
            return;
        }

        let plan = {
            let mut state = ctx.session.shared.state.lock().await;
            let plan = state.lifecycle.mark_closed(&close_reason);
            state.next_retry = plan.reconnect_after;
            state.last_error = match (&close_reason, &plan.terminal_error) {
                (_, Some(message)) => Some(message.clone()),
                (CloseReason::Abnormal(message), None) => Some(message.clone()),
                _ => None,
            };
            plan
        };
        ctx.session
            .notify(SyncUpdate::ConnectionChanged(session_id.clone()));

        match plan.reconnect_after {
            Some(delay) => {
                debug!(
                    "session {} closed ({:?}); reconnecting in {:?}",
                    session_id, close_reason, delay
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                if let Some(message) = plan.terminal_error {
                    warn!("session {} stream rejected: {}", session_id, message);
                } else {
                    debug!("session {} stream closed gracefully", session_id);
                }
                return;
            }
        }
    }
}

async fn pump_events(
    ctx: &ControllerContext,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> PumpEnd {
    while let Some(event) = events.recv().await {
        if ctx.session.shared.closing.load(Ordering::Acquire) {
            return PumpEnd::Closing;
        }
        match event {
            TransportEvent::Opened => {
                {
                    let mut state = ctx.session.shared.state.lock().await;
                    state.lifecycle.mark_open();
                    state.next_retry = None;
                    state.last_error = None;
                }
                ctx.session
                    .notify(SyncUpdate::ConnectionChanged(ctx.session.session_id.clone()));
            }
            TransportEvent::Frame(text) => {
                handle_frame(ctx, &text).await;
            }
            TransportEvent::Closed(reason) => return PumpEnd::Closed(reason),
        }
    }
    PumpEnd::Closed(CloseReason::Abnormal("event stream dropped".to_string()))
}

async fn handle_frame(ctx: &ControllerContext, text: &str) {
    let envelope = match decode_envelope(text) {
        Ok(envelope) => envelope,
        Err(error) => {
            // Malformed frames are dropped; the rest of the stream continues.
            warn!(
                "dropping undecodable frame on {}: {}",
                ctx.session.session_id, error
            );
            return;
        }
    };

    let cursor = ctx.session.shared.cursor.load(Ordering::Acquire);
    if envelope.seq <= cursor {
        debug!(
            "discarding duplicate seq {} (cursor {}) on {}",
            envelope.seq, cursor, ctx.session.session_id
        );
        return;
    }

    if let Err(error) = ctx.event_log.append(&ctx.session.session_id, text).await {
        warn!("event log append failed on {}: {}", ctx.session.session_id, error);
    }

    apply_envelope(&ctx.session, &envelope).await;
}

/// Fold one past-the-cursor envelope into session state and advance the
/// cursor. Also used for event-log replay on track.
pub(crate) async fn apply_envelope(session: &SessionCtx, envelope: &Envelope) {
    let (timeline_changed, streaming_changed, permissions_changed) = {
        let mut state = session.shared.state.lock().await;
        if session.shared.closing.load(Ordering::Acquire) {
            return;
        }

        let outcome = state.folder.fold(&envelope.event);
        let timeline_changed = !outcome.items.is_empty();
        state.timeline.extend(outcome.items);

        let mut streaming_changed = false;
        if let Some(streaming) = outcome.streaming
            && state.is_streaming != streaming
        {
            state.is_streaming = streaming;
            streaming_changed = true;
        }

        let permissions_changed = match outcome.permission {
            Some(PermissionSignal::Requested(payload)) => {
                state.arbiter.on_request(&session.session_id, &payload)
            }
            Some(PermissionSignal::Resolved { request_id }) => {
                state.arbiter.resolve(&request_id).is_some()
            }
            None => false,
        };

        state.record.updated_at = Utc::now();
        (timeline_changed, streaming_changed, permissions_changed)
    };

    session.shared.cursor.fetch_max(envelope.seq, Ordering::AcqRel);
    if let Ok(mut store) = session.cursors.lock() {
        if let Err(error) = store.advance(&session.session_id, envelope.seq) {
            warn!("cursor persist failed on {}: {}", session.session_id, error);
        }
    }

    // Removal may have started since the fold; stay quiet once it has.
    if session.shared.closing.load(Ordering::Acquire) {
        return;
    }
    if timeline_changed {
        session.notify(SyncUpdate::TimelineChanged(session.session_id.clone()));
    }
    if streaming_changed {
        session.notify(SyncUpdate::ConnectionChanged(session.session_id.clone()));
    }
    if permissions_changed {
        session.notify(SyncUpdate::PermissionsChanged(session.session_id.clone()));
    }
}
