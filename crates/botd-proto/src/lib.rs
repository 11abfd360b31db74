//! Wire contract for the bot daemon session stream.
//!
//! One envelope per frame: `{ "event": <kind>, "seq": <int>, "payload": {...} }`.
//! Unknown event kinds decode to a catch-all variant so newer daemons never
//! break older clients.

pub mod envelope;
pub mod error;
pub mod outbound;

pub use envelope::{Envelope, StreamEvent, decode_envelope};
pub use error::{ProtoError, Result};
pub use outbound::{ClientMessage, PermissionDecision};
