//! End-to-end synchronizer behavior over a scripted in-memory transport.
//!
//! Each test scripts the connections a session will get, in order. Once the
//! script runs out every further dial is denied, which keeps terminal-state
//! assertions honest.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use botd_client::{
    ClientError, CloseReason, CursorStore, Endpoint, EventLog, MemoryEventLog, PermissionDecision,
    SessionRecord, SessionTransport, SyncConfig, SyncUpdate, Synchronizer, TimelineItem,
    TransportConnection, TransportEvent, TransportHandle,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Conn {
    /// `connect` fails outright.
    Deny(&'static str),
    /// `connect` succeeds; `Opened` is emitted, then the scripted events.
    /// With `hold` the connection stays open after the script.
    Serve {
        events: Vec<TransportEvent>,
        hold: bool,
    },
}

struct ScriptedTransport {
    script: StdMutex<VecDeque<Conn>>,
    sent: Arc<StdMutex<Vec<String>>>,
    dials: StdMutex<Vec<u64>>,
    // Held so scripted connections with `hold` stay open.
    keepalive: StdMutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Conn>) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(script.into()),
            sent: Arc::new(StdMutex::new(Vec::new())),
            dials: StdMutex::new(Vec::new()),
            keepalive: StdMutex::new(Vec::new()),
        })
    }

    fn dials(&self) -> Vec<u64> {
        lock(&self.dials).clone()
    }

    fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Push an event on the most recent held-open connection.
    fn push_live(&self, event: TransportEvent) {
        if let Some(sender) = lock(&self.keepalive).last() {
            let _ = sender.send(event);
        }
    }
}

struct ScriptedHandle {
    sent: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl TransportHandle for ScriptedHandle {
    async fn send(&self, frame: String) -> botd_client::Result<()> {
        lock(&self.sent).push(frame);
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _session_id: &str,
        after_seq: u64,
    ) -> botd_client::Result<TransportConnection> {
        lock(&self.dials).push(after_seq);
        let conn = lock(&self.script).pop_front();
        let (events, hold) = match conn {
            Some(Conn::Deny(message)) => {
                return Err(ClientError::Connection(message.to_string()));
            }
            None => return Err(ClientError::Connection("unscripted dial".to_string())),
            Some(Conn::Serve { events, hold }) => (events, hold),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(TransportEvent::Opened);
        for event in events {
            let _ = events_tx.send(event);
        }
        if hold {
            lock(&self.keepalive).push(events_tx);
        }
        Ok(TransportConnection {
            handle: Box::new(ScriptedHandle {
                sent: Arc::clone(&self.sent),
            }),
            events: events_rx,
        })
    }
}

fn frame(seq: u64, event: &str, payload: Value) -> TransportEvent {
    TransportEvent::Frame(json!({"event": event, "seq": seq, "payload": payload}).to_string())
}

fn closed(reason: CloseReason) -> TransportEvent {
    TransportEvent::Closed(reason)
}

fn record(session_id: &str) -> SessionRecord {
    SessionRecord {
        session_id: session_id.to_string(),
        workspace: "/tmp/demo".to_string(),
        title: Some("demo".to_string()),
        offline: false,
        updated_at: Utc::now(),
    }
}

struct Harness {
    sync: Synchronizer,
    transport: Arc<ScriptedTransport>,
    log: Arc<MemoryEventLog>,
    _updates: mpsc::UnboundedReceiver<SyncUpdate>,
    _tmp: tempfile::TempDir,
}

fn harness(script: Vec<Conn>) -> botd_client::Result<Harness> {
    let tmp = tempfile::tempdir()?;
    let mut config = SyncConfig::new(
        Endpoint::new("ws://127.0.0.1:9", "http://127.0.0.1:9"),
        "client-test",
    );
    config.backoff_base = Duration::from_millis(2);
    config.backoff_cap = Duration::from_millis(10);
    config.health_poll_interval = Duration::from_secs(60);
    config.health_probe_timeout = Duration::from_millis(200);

    let transport = ScriptedTransport::new(script);
    let cursors = Arc::new(StdMutex::new(CursorStore::load(
        tmp.path().join("cursors.json"),
    )));
    let log = Arc::new(MemoryEventLog::default());
    let (sync, updates) = Synchronizer::with_parts(
        config,
        Arc::clone(&transport) as Arc<dyn SessionTransport>,
        cursors,
        Arc::clone(&log) as Arc<dyn EventLog>,
    );
    Ok(Harness {
        sync,
        transport,
        log,
        _updates: updates,
        _tmp: tmp,
    })
}

async fn eventually(what: &str, condition: impl AsyncFn() -> bool) {
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(condition().await, "timed out waiting for {what}");
}

#[tokio::test]
async fn resume_discards_duplicates_and_dials_past_the_cursor() -> botd_client::Result<()> {
    let harness = harness(vec![
        Conn::Serve {
            events: vec![
                frame(1, "turn-start", Value::Null),
                frame(2, "token-fragment", json!({"text": "Hi"})),
                closed(CloseReason::Abnormal("socket reset".to_string())),
            ],
            hold: false,
        },
        Conn::Serve {
            events: vec![
                frame(2, "token-fragment", json!({"text": "Hi"})),
                frame(3, "turn-done", Value::Null),
            ],
            hold: true,
        },
    ])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("timeline to settle", async || {
        sync.timeline("sess-1")
            .await
            .map(|items| items.len() == 2)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(
        sync.timeline("sess-1").await?,
        vec![
            TimelineItem::Assistant {
                text: "Hi".to_string()
            },
            TimelineItem::System {
                text: "Turn complete".to_string()
            },
        ]
    );
    assert_eq!(harness.transport.dials(), vec![0, 2]);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn graceful_close_stops_reconnecting() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![
            frame(1, "turn-start", Value::Null),
            closed(CloseReason::Graceful),
        ],
        hold: false,
    }])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("disconnect", async || {
        sync.snapshot("sess-1")
            .await
            .map(|snapshot| snapshot.connection_state.as_str() == "disconnected")
            .unwrap_or(false)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.dials().len(), 1);
    let snapshot = sync.snapshot("sess-1").await?;
    assert_eq!(snapshot.last_error, None);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_close_is_terminal_with_an_error() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![closed(CloseReason::Rejected(
            "authorization rejected".to_string(),
        ))],
        hold: false,
    }])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("terminal rejection", async || {
        sync.snapshot("sess-1")
            .await
            .map(|snapshot| {
                snapshot.connection_state.as_str() == "disconnected"
                    && snapshot
                        .last_error
                        .as_deref()
                        .is_some_and(|error| error.contains("authorization"))
            })
            .unwrap_or(false)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.dials().len(), 1);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn connect_failures_back_off_then_recover() -> botd_client::Result<()> {
    let harness = harness(vec![
        Conn::Deny("connection refused"),
        Conn::Deny("connection refused"),
        Conn::Serve {
            events: vec![frame(1, "turn-start", Value::Null)],
            hold: true,
        },
    ])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("recovery", async || {
        sync.snapshot("sess-1")
            .await
            .map(|snapshot| {
                snapshot.connection_state.as_str() == "connected" && snapshot.is_streaming
            })
            .unwrap_or(false)
    })
    .await;

    assert_eq!(harness.transport.dials().len(), 3);
    let snapshot = sync.snapshot("sess-1").await?;
    assert_eq!(snapshot.reconnect_attempts, 0);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn submit_reaches_the_wire_and_marks_streaming() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![],
        hold: true,
    }])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("connection", async || {
        sync.snapshot("sess-1")
            .await
            .map(|snapshot| snapshot.connection_state.as_str() == "connected")
            .unwrap_or(false)
    })
    .await;

    sync.submit_message("sess-1", "run the tests", None).await?;

    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("submit-turn"));
    assert!(sent[0].contains("run the tests"));
    assert!(sent[0].contains("\"mode\":\"chat\""));

    let snapshot = sync.snapshot("sess-1").await?;
    assert!(snapshot.is_streaming);
    assert_eq!(
        sync.timeline("sess-1").await?,
        vec![TimelineItem::User {
            text: "run the tests".to_string()
        }]
    );
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn submit_without_a_connection_surfaces_a_system_item() -> botd_client::Result<()> {
    let harness = harness(vec![])?;
    harness.sync.track_session(record("sess-1")).await?;

    harness.sync.submit_message("sess-1", "hello?", None).await?;

    let timeline = harness.sync.timeline("sess-1").await?;
    assert_eq!(timeline.len(), 2);
    assert_eq!(
        timeline[0],
        TimelineItem::User {
            text: "hello?".to_string()
        }
    );
    let text = match &timeline[1] {
        TimelineItem::System { text } => text.clone(),
        other => format!("unexpected item: {other:?}"),
    };
    assert!(text.starts_with("Send failed"), "got: {text}");
    let snapshot = harness.sync.snapshot("sess-1").await?;
    assert!(!snapshot.is_streaming);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn permission_requests_resolve_once() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![frame(
            1,
            "permission-request",
            json!({"requestId": "r1", "tool": "bash", "args": {"command": "rm -rf target"}}),
        )],
        hold: true,
    }])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("pending permission", async || {
        sync.pending_permissions("sess-1")
            .await
            .map(|pending| pending.len() == 1)
            .unwrap_or(false)
    })
    .await;

    sync.resolve_permission("sess-1", "r1", PermissionDecision::Allow)
        .await?;
    assert!(sync.pending_permissions("sess-1").await?.is_empty());

    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("resolve-permission"));
    assert!(sent[0].contains("\"requestId\":\"r1\""));
    assert!(sent[0].contains("\"decision\":\"allow\""));

    // Second resolution of the same id sends nothing.
    sync.resolve_permission("sess-1", "r1", PermissionDecision::Deny)
        .await?;
    assert_eq!(harness.transport.sent().len(), 1);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn remote_resolution_clears_the_pending_set() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![
            frame(
                1,
                "permission-request",
                json!({"requestId": "r1", "tool": "bash", "args": {}}),
            ),
            frame(
                2,
                "permission-resolved",
                json!({"requestId": "r1", "decision": "deny"}),
            ),
        ],
        hold: true,
    }])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("remote resolution applied", async || {
        match (sync.pending_permissions("sess-1").await, sync.snapshot("sess-1").await) {
            (Ok(pending), Ok(snapshot)) => {
                pending.is_empty() && snapshot.connection_state.as_str() == "connected"
            }
            _ => false,
        }
    })
    .await;

    // Permission traffic never lands on the timeline.
    assert!(sync.timeline("sess-1").await?.is_empty());
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn removed_sessions_keep_their_cursor_but_lose_their_log() -> botd_client::Result<()> {
    let harness = harness(vec![
        Conn::Serve {
            events: vec![
                frame(1, "turn-start", Value::Null),
                frame(2, "token-fragment", json!({"text": "a"})),
                frame(3, "turn-done", Value::Null),
            ],
            hold: true,
        },
        Conn::Serve {
            events: vec![],
            hold: true,
        },
    ])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("timeline", async || {
        sync.timeline("sess-1")
            .await
            .map(|items| items.len() == 2)
            .unwrap_or(false)
    })
    .await;

    sync.remove_session("sess-1").await?;
    assert!(sync.sessions().await.is_empty());
    assert!(matches!(
        sync.timeline("sess-1").await,
        Err(ClientError::UnknownSession(_))
    ));
    assert!(harness.log.load("sess-1").await?.is_empty());

    // Re-tracking resumes past the retained cursor with an empty timeline.
    sync.track_session(record("sess-1")).await?;
    eventually("re-dial", async || harness.transport.dials().len() == 2).await;
    assert_eq!(harness.transport.dials(), vec![0, 3]);
    assert!(sync.timeline("sess-1").await?.is_empty());
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn frames_arriving_after_removal_never_mutate_state() -> botd_client::Result<()> {
    let harness = harness(vec![
        Conn::Serve {
            events: vec![
                frame(1, "turn-start", Value::Null),
                frame(7, "turn-done", Value::Null),
            ],
            hold: true,
        },
        Conn::Serve {
            events: vec![],
            hold: true,
        },
    ])?;

    harness.sync.track_session(record("sess-1")).await?;
    let sync = &harness.sync;
    eventually("first turn applied", async || {
        sync.timeline("sess-1")
            .await
            .map(|items| items.len() == 1)
            .unwrap_or(false)
    })
    .await;

    sync.remove_session("sess-1").await?;
    // The old connection is still alive; a late envelope on it must be inert.
    harness
        .transport
        .push_live(frame(50, "turn-done", Value::Null));
    tokio::time::sleep(Duration::from_millis(20)).await;

    sync.track_session(record("sess-1")).await?;
    eventually("re-dial", async || harness.transport.dials().len() == 2).await;
    assert_eq!(harness.transport.dials(), vec![0, 7]);
    assert!(sync.timeline("sess-1").await?.is_empty());
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tracked_sessions_replay_their_log_before_subscribing() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![],
        hold: true,
    }])?;

    for (seq, event, payload) in [
        (1, "turn-start", Value::Null),
        (2, "token-fragment", json!({"text": "Hi"})),
        (3, "turn-done", Value::Null),
    ] {
        let raw = json!({"event": event, "seq": seq, "payload": payload}).to_string();
        harness.log.append("sess-1", &raw).await?;
    }

    harness.sync.track_session(record("sess-1")).await?;
    assert_eq!(
        harness.sync.timeline("sess-1").await?,
        vec![
            TimelineItem::Assistant {
                text: "Hi".to_string()
            },
            TimelineItem::System {
                text: "Turn complete".to_string()
            },
        ]
    );
    // The replayed cursor carries into the first dial.
    eventually("dial", async || !harness.transport.dials().is_empty()).await;
    assert_eq!(harness.transport.dials(), vec![3]);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn create_session_falls_back_to_offline() -> botd_client::Result<()> {
    let harness = harness(vec![])?;
    let record = harness
        .sync
        .create_session("/tmp/demo", Some("offline work".to_string()))
        .await?;

    assert!(record.offline);
    assert!(!record.session_id.is_empty());
    assert_eq!(record.workspace, "/tmp/demo");

    let sessions = harness.sync.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, record.session_id);
    harness.sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tracking_twice_is_a_no_op() -> botd_client::Result<()> {
    let harness = harness(vec![Conn::Serve {
        events: vec![],
        hold: true,
    }])?;

    harness.sync.track_session(record("sess-1")).await?;
    harness.sync.track_session(record("sess-1")).await?;
    eventually("dial", async || !harness.transport.dials().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.transport.dials().len(), 1);
    assert_eq!(harness.sync.sessions().await.len(), 1);
    harness.sync.shutdown().await;
    Ok(())
}
