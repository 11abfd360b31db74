//! Session stream synchronizer for bot daemon frontends.
//!
//! Keeps any number of sessions live against a remote daemon: one websocket
//! subscription per session with cursor-based resume, capped exponential
//! reconnect backoff, token-fragment folding into a user-facing timeline,
//! and tool-permission arbitration. Frontends construct a [`Synchronizer`],
//! drive it through its async operations, and redraw on [`SyncUpdate`]
//! notifications.

pub mod config;
pub mod cursor;
pub mod error;
pub mod eventlog;
pub mod health;
pub mod permissions;
pub mod reconnect;
pub mod session;
pub mod sync;
pub mod timeline;
pub mod transport;

pub use botd_proto::{ClientMessage, Envelope, PermissionDecision, StreamEvent, decode_envelope};
pub use config::{Endpoint, SyncConfig, TransportConfig};
pub use cursor::CursorStore;
pub use error::{ClientError, Result};
pub use eventlog::{EventLog, MemoryEventLog};
pub use health::{DaemonHealth, HealthClient};
pub use permissions::{PermissionArbiter, PermissionRequest};
pub use reconnect::{ControllerState, Lifecycle, ReconnectPlan, backoff_delay};
pub use session::{ConnectionState, SessionRecord, SessionSnapshot};
pub use sync::{SyncUpdate, Synchronizer};
pub use timeline::{FoldOutcome, TimelineFolder, TimelineItem};
pub use transport::{
    CloseReason, SessionTransport, TransportConnection, TransportEvent, TransportHandle,
    WebSocketTransport,
};
