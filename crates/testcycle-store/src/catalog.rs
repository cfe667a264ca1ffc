use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::parser::parse_session;
use crate::store::JsonlStateStore;
use crate::types::{Session, SessionSummary};

/// Provides access to the session files in a state directory.
pub struct SessionCatalog {
    sessions_dir: PathBuf,
}

impl SessionCatalog {
    /// Catalog over the default directory, `<data_dir>/testcycle/sessions`.
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            sessions_dir: Self::default_dir()?,
        })
    }

    /// Catalog over a custom directory (useful for testing).
    pub fn with_dir(sessions_dir: PathBuf) -> Self {
        Self { sessions_dir }
    }

    pub fn default_dir() -> Result<PathBuf, StoreError> {
        let data_dir = dirs::data_dir().ok_or(StoreError::NoDataDir)?;
        Ok(data_dir.join("testcycle").join("sessions"))
    }

    /// Id for a new session: its start time plus a short hash of the
    /// working directory, e.g. `2026-01-20T10-00-00Z_3fa2c1`.
    pub fn new_session_id(working_dir: &Path, now: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(working_dir.to_string_lossy().as_bytes());
        let hash = hex::encode(hasher.finalize());
        format!("{}_{}", now.format("%Y-%m-%dT%H-%M-%SZ"), &hash[..6])
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Open (creating if needed) the store for a session.
    pub fn open(&self, session_id: &str) -> Result<JsonlStateStore, StoreError> {
        JsonlStateStore::open(&self.sessions_dir, session_id)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.session_path(session_id).exists()
    }

    /// Fully parse a session by id.
    pub fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        parse_session(&path)
    }

    /// List sessions, newest first. Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }

            match parse_session(&path) {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(e) => {
                    tracing::warn!("Failed to parse session {:?}: {}", path, e);
                }
            }
        }

        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", session_id))
    }
}
