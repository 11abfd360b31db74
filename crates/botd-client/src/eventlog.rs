//! Append-only per-session event log seam.
//!
//! The durable implementation belongs to the host application; the client
//! only needs load-on-track and append-on-receive. Frames are stored raw so
//! the log survives wire-format additions it does not understand.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// Per-session raw-frame log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// All frames previously logged for a session, in append order.
    async fn load(&self, session_id: &str) -> Result<Vec<String>>;

    /// Append one received frame.
    async fn append(&self, session_id: &str, frame: &str) -> Result<()>;

    /// Drop a session's log on removal.
    async fn forget(&self, session_id: &str) -> Result<()>;
}

/// In-memory log, used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    frames: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn load(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self
            .frames
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, session_id: &str, frame: &str) -> Result<()> {
        self.frames
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(frame.to_string());
        Ok(())
    }

    async fn forget(&self, session_id: &str) -> Result<()> {
        self.frames.write().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_log_appends_and_loads_in_order() -> Result<()> {
        let log = MemoryEventLog::default();
        log.append("sess-1", "a").await?;
        log.append("sess-1", "b").await?;
        log.append("sess-2", "c").await?;
        assert_eq!(log.load("sess-1").await?, vec!["a", "b"]);
        assert_eq!(log.load("sess-2").await?, vec!["c"]);
        assert!(log.load("sess-3").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn forget_clears_one_session_only() -> Result<()> {
        let log = MemoryEventLog::default();
        log.append("sess-1", "a").await?;
        log.append("sess-2", "b").await?;
        log.forget("sess-1").await?;
        assert!(log.load("sess-1").await?.is_empty());
        assert_eq!(log.load("sess-2").await?, vec!["b"]);
        Ok(())
    }
}
