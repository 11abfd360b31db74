//! Composition root: multi-session stream synchronizer.
//!
//! Owns the tracked-session map, the shared cursor store, the event log and
//! the health poller, and spawns one reconnection controller per session.
//! Callers observe state through cloned snapshots and a coarse update
//! channel; all mutation happens behind the per-session lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::Ordering;

use botd_proto::{ClientMessage, PermissionDecision, decode_envelope};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SyncConfig, TransportConfig};
use crate::cursor::CursorStore;
use crate::error::{ClientError, Result};
use crate::eventlog::{EventLog, MemoryEventLog};
use crate::health::{DaemonHealth, HealthClient, run_health_poller};
use crate::permissions::PermissionRequest;
use crate::reconnect::{
    ControllerContext, SessionCtx, SessionShared, SessionState, apply_envelope, run_controller,
};
use crate::session::{SessionRecord, SessionSnapshot};
use crate::timeline::TimelineItem;
use crate::transport::{SessionTransport, WebSocketTransport, dial_timeout_bounded};

/// Coarse change notifications. Consumers re-query the synchronizer for the
/// actual state; notifications never carry payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    SessionsChanged,
    TimelineChanged(String),
    ConnectionChanged(String),
    PermissionsChanged(String),
    HealthChanged,
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    task: JoinHandle<()>,
}

/// Multi-session synchronizer for one daemon endpoint.
pub struct Synchronizer {
    config: SyncConfig,
    transport: Arc<dyn SessionTransport>,
    http: reqwest::Client,
    cursors: Arc<StdMutex<CursorStore>>,
    event_log: Arc<dyn EventLog>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    health: Arc<RwLock<DaemonHealth>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    updates_tx: mpsc::UnboundedSender<SyncUpdate>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    workspace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    client_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
}

impl Synchronizer {
    /// Build a synchronizer over the real websocket transport and the
    /// default on-disk cursor store. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(config: SyncConfig) -> (Self, mpsc::UnboundedReceiver<SyncUpdate>) {
        let dial_timeout = dial_timeout_bounded(&config.transport, config.backoff_base);
        let transport = Arc::new(WebSocketTransport::new(TransportConfig { dial_timeout }));
        let cursors = Arc::new(StdMutex::new(CursorStore::load_default()));
        let event_log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::default());
        Self::with_parts(config, transport, cursors, event_log)
    }

    /// Build from explicit parts. Used by tests to substitute the transport,
    /// cursor store and event log.
    #[must_use]
    pub fn with_parts(
        config: SyncConfig,
        transport: Arc<dyn SessionTransport>,
        cursors: Arc<StdMutex<CursorStore>>,
        event_log: Arc<dyn EventLog>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let http = reqwest::Client::new();
        let health = Arc::new(RwLock::new(DaemonHealth::default()));
        let health_task = tokio::spawn(run_health_poller(
            HealthClient::new(http.clone(), &config.endpoint, config.health_probe_timeout),
            config.health_poll_interval,
            Arc::clone(&health),
            updates_tx.clone(),
        ));

        let synchronizer = Self {
            config,
            transport,
            http,
            cursors,
            event_log,
            sessions: RwLock::new(HashMap::new()),
            health,
            health_task: Mutex::new(Some(health_task)),
            updates_tx,
        };
        (synchronizer, updates_rx)
    }

    /// Create a session on the daemon and start tracking it. When the daemon
    /// is unreachable the session is created locally with a generated id and
    /// marked offline; its controller still runs and will catch up once the
    /// daemon accepts the stream.
    pub async fn create_session(
        &self,
        workspace: impl Into<String>,
        title: Option<String>,
    ) -> Result<SessionRecord> {
        let workspace = workspace.into();
        let record = match self.request_create(&workspace, title.as_deref()).await {
            Ok(session_id) => {
                info!("created session {session_id}");
                SessionRecord {
                    session_id,
                    workspace,
                    title,
                    offline: false,
                    updated_at: Utc::now(),
                }
            }
            Err(error) => {
                warn!("session create failed, falling back to offline: {error}");
                SessionRecord {
                    session_id: Uuid::new_v4().to_string(),
                    workspace,
                    title,
                    offline: true,
                    updated_at: Utc::now(),
                }
            }
        };
        self.install(record.clone(), false).await?;
        Ok(record)
    }

    async fn request_create(&self, workspace: &str, title: Option<&str>) -> Result<String> {
        let url = format!(
            "{}/v1/sessions",
            self.config.endpoint.http_url.trim_end_matches('/')
        );
        let mut request = self
            .http
            .post(&url)
            .timeout(self.config.http_request_timeout)
            .json(&CreateSessionRequest {
                workspace,
                title,
                client_id: &self.config.client_id,
            });
        if let Some(token) = self.config.endpoint.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|error| ClientError::Http(error.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Http(format!(
                "session create returned {}",
                response.status()
            )));
        }
        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|error| ClientError::Http(error.to_string()))?;
        Ok(body.session_id)
    }

    /// Start tracking an existing session: seed the cursor from the durable
    /// store, rebuild the timeline from the event log, then subscribe past
    /// the cursor. Tracking an already-tracked session is a no-op.
    pub async fn track_session(&self, record: SessionRecord) -> Result<()> {
        self.install(record, true).await
    }

    async fn install(&self, record: SessionRecord, replay: bool) -> Result<()> {
        let session_id = record.session_id.clone();
        if self.sessions.read().await.contains_key(&session_id) {
            debug!("session {session_id} already tracked");
            return Ok(());
        }

        let seeded = self
            .cursors
            .lock()
            .ok()
            .and_then(|store| store.seq(&session_id))
            .unwrap_or(0);

        let state = SessionState::new(record, &self.config);
        let shared = Arc::new(SessionShared::new(state, seeded));
        let ctx = SessionCtx {
            session_id: session_id.clone(),
            shared: Arc::clone(&shared),
            cursors: Arc::clone(&self.cursors),
            updates: self.updates_tx.clone(),
        };

        if replay {
            for frame in self.event_log.load(&session_id).await? {
                match decode_envelope(&frame) {
                    Ok(envelope) => apply_envelope(&ctx, &envelope).await,
                    Err(error) => {
                        warn!("skipping undecodable logged frame on {session_id}: {error}");
                    }
                }
            }
        }

        let controller = ControllerContext {
            session: ctx,
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            event_log: Arc::clone(&self.event_log),
        };
        let task = tokio::spawn(run_controller(controller));

        self.sessions
            .write()
            .await
            .insert(session_id, SessionEntry { shared, task });
        let _ = self.updates_tx.send(SyncUpdate::SessionsChanged);
        Ok(())
    }

    /// Stop tracking a session. After this returns, no event from the old
    /// subscription mutates synchronizer state. The durable cursor is kept
    /// so re-tracking resumes where it left off; the event log is dropped.
    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))?;

        entry.shared.closing.store(true, Ordering::Release);
        entry.task.abort();
        if let Some(handle) = entry.shared.writer.lock().await.take() {
            handle.close().await;
        }
        // Taking the state lock waits out any in-flight apply.
        entry.shared.state.lock().await.lifecycle.mark_stopped();

        self.event_log.forget(session_id).await?;
        let _ = self.updates_tx.send(SyncUpdate::SessionsChanged);
        Ok(())
    }

    /// Submit a user turn. The user's item lands on the timeline before the
    /// send; a send failure surfaces as a system item and leaves the session
    /// idle rather than failing the call.
    pub async fn submit_message(
        &self,
        session_id: &str,
        content: impl Into<String>,
        mode: Option<String>,
    ) -> Result<()> {
        let shared = self.session_shared(session_id).await?;
        let content = content.into();

        {
            let mut state = shared.state.lock().await;
            state.timeline.push(TimelineItem::User {
                text: content.clone(),
            });
            state.record.updated_at = Utc::now();
        }
        let _ = self
            .updates_tx
            .send(SyncUpdate::TimelineChanged(session_id.to_string()));

        let frame = ClientMessage::SubmitTurn {
            content,
            client_id: self.config.client_id.clone(),
            writer_id: self.config.writer_id.clone(),
            mode: mode.unwrap_or_else(|| self.config.default_mode.clone()),
        }
        .encode()?;

        match self.send_frame(&shared, frame).await {
            Ok(()) => {
                {
                    let mut state = shared.state.lock().await;
                    state.is_streaming = true;
                }
                let _ = self
                    .updates_tx
                    .send(SyncUpdate::ConnectionChanged(session_id.to_string()));
            }
            Err(error) => {
                warn!("submit on {session_id} failed: {error}");
                {
                    let mut state = shared.state.lock().await;
                    state.timeline.push(TimelineItem::System {
                        text: format!("Send failed: {error}"),
                    });
                }
                let _ = self
                    .updates_tx
                    .send(SyncUpdate::TimelineChanged(session_id.to_string()));
            }
        }
        Ok(())
    }

    /// Ask the daemon to cancel the active turn. Best effort: streaming
    /// state only flips when the stream confirms the cancellation.
    pub async fn cancel_active_turn(&self, session_id: &str) -> Result<()> {
        let shared = self.session_shared(session_id).await?;
        let frame = ClientMessage::Cancel {
            writer_id: self.config.writer_id.clone(),
        }
        .encode()?;
        if let Err(error) = self.send_frame(&shared, frame).await {
            warn!("cancel on {session_id} failed: {error}");
        }
        Ok(())
    }

    /// Resolve an open permission request. The local open set updates
    /// immediately; if the send fails the remote resolution event reconciles
    /// on reconnect, so nothing is rolled back. Resolving an unknown request
    /// id is a no-op.
    pub async fn resolve_permission(
        &self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        let shared = self.session_shared(session_id).await?;
        let was_open = {
            let mut state = shared.state.lock().await;
            state.arbiter.resolve(request_id).is_some()
        };
        if !was_open {
            debug!("permission {request_id} on {session_id} already resolved");
            return Ok(());
        }
        let _ = self
            .updates_tx
            .send(SyncUpdate::PermissionsChanged(session_id.to_string()));

        let frame = ClientMessage::ResolvePermission {
            request_id: request_id.to_string(),
            decision,
            writer_id: self.config.writer_id.clone(),
        }
        .encode()?;
        if let Err(error) = self.send_frame(&shared, frame).await {
            warn!("permission resolution send on {session_id} failed: {error}");
        }
        Ok(())
    }

    /// Tracked sessions, most recently updated first.
    pub async fn sessions(&self) -> Vec<SessionRecord> {
        let sessions = self.sessions.read().await;
        let mut records = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            records.push(entry.shared.state.lock().await.record.clone());
        }
        drop(sessions);
        records.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        records
    }

    pub async fn timeline(&self, session_id: &str) -> Result<Vec<TimelineItem>> {
        let shared = self.session_shared(session_id).await?;
        let state = shared.state.lock().await;
        Ok(state.timeline.clone())
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let shared = self.session_shared(session_id).await?;
        let state = shared.state.lock().await;
        Ok(SessionSnapshot {
            record: state.record.clone(),
            connection_state: state.connection_state(),
            is_streaming: state.is_streaming,
            reconnect_attempts: state.lifecycle.attempts(),
            next_retry: state.next_retry,
            last_error: state.last_error.clone(),
        })
    }

    pub async fn pending_permissions(&self, session_id: &str) -> Result<Vec<PermissionRequest>> {
        let shared = self.session_shared(session_id).await?;
        let state = shared.state.lock().await;
        Ok(state.arbiter.open().to_vec())
    }

    pub async fn health(&self) -> DaemonHealth {
        self.health.read().await.clone()
    }

    /// Stop every controller and the health poller. Durable cursors stay.
    pub async fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
        let mut sessions = self.sessions.write().await;
        for (_, entry) in sessions.drain() {
            entry.shared.closing.store(true, Ordering::Release);
            entry.task.abort();
            if let Some(handle) = entry.shared.writer.lock().await.take() {
                handle.close().await;
            }
            entry.shared.state.lock().await.lifecycle.mark_stopped();
        }
    }

    async fn session_shared(&self, session_id: &str) -> Result<Arc<SessionShared>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| Arc::clone(&entry.shared))
            .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))
    }

    async fn send_frame(&self, shared: &SessionShared, frame: String) -> Result<()> {
        let writer = shared.writer.lock().await;
        match writer.as_ref() {
            Some(handle) => handle.send(frame).await,
            None => Err(ClientError::NotConnected),
        }
    }
}
