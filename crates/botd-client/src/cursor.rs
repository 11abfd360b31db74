//! Durable per-session resume cursors.
//!
//! One versioned JSON document holds the last applied seq per session. A
//! corrupt or missing file recovers as empty; resumption then starts from
//! seq 0 and relies on duplicate discard upstream.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

const CURSOR_SCHEMA_VERSION: u32 = 1;
const CURSOR_FILE_NAME: &str = "botd-session-cursors.v1.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorEntry {
    pub session_id: String,
    pub seq: u64,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorDocument {
    version: u32,
    entries: Vec<CursorEntry>,
}

/// Per-session high-water-mark store.
#[derive(Debug, Clone, Default)]
pub struct CursorStore {
    path: PathBuf,
    entries: HashMap<String, CursorEntry>,
}

impl CursorStore {
    pub fn load_default() -> Self {
        Self::load(default_cursor_path())
    }

    pub fn load(path: PathBuf) -> Self {
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                return Self {
                    path,
                    entries: HashMap::new(),
                };
            }
        };
        let parsed = serde_json::from_str::<CursorDocument>(raw.as_str());
        let mut entries = HashMap::new();
        if let Ok(document) = parsed
            && document.version == CURSOR_SCHEMA_VERSION
        {
            for entry in document.entries {
                entries.insert(entry.session_id.clone(), entry);
            }
        }
        Self { path, entries }
    }

    #[must_use]
    pub fn seq(&self, session_id: &str) -> Option<u64> {
        self.entries.get(session_id).map(|entry| entry.seq)
    }

    /// Advance the cursor, monotonically. A lower seq never rewinds it.
    pub fn advance(&mut self, session_id: &str, seq: u64) -> Result<()> {
        let existing = self
            .entries
            .get(session_id)
            .map(|entry| entry.seq)
            .unwrap_or(0);
        let next = existing.max(seq);
        self.entries.insert(
            session_id.to_string(),
            CursorEntry {
                session_id: session_id.to_string(),
                seq: next,
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entries = self.entries.values().cloned().collect::<Vec<_>>();
        entries.sort_by(|left, right| left.session_id.cmp(&right.session_id));
        let encoded = serde_json::to_string_pretty(&CursorDocument {
            version: CURSOR_SCHEMA_VERSION,
            entries,
        })
        .map_err(|error| ClientError::Internal(format!("cursor encode failed: {error}")))?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }
}

fn default_cursor_path() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("botd");
        data_dir.push(CURSOR_FILE_NAME);
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".botd");
        home_dir.push(CURSOR_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(CURSOR_FILE_NAME)
}
