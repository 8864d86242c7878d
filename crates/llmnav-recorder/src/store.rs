//! Directory-backed store of finished session traces.
//!
//! One pretty-printed JSON file per session, named `session_<id>.json`.
//! Scoring tools read these files directly.
//!
//! # Example
//!
//! ```rust
//! use llmnav_recorder::{SessionTrace, TraceStore};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = TraceStore::open(dir.path()).unwrap();
//!
//! let trace = SessionTrace::new("42", "llava", "find the door");
//! store.save(&trace).unwrap();
//!
//! assert_eq!(store.list().unwrap(), vec!["42".to_string()]);
//! assert_eq!(store.load("42").unwrap().prompt, "find the door");
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::trace::SessionTrace;

const FILE_PREFIX: &str = "session_";
const FILE_SUFFIX: &str = ".json";

/// Errors that can arise from trace store operations.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Trace encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Trace not found: {0}")]
    NotFound(String),
}

/// Handle to a trace directory.
#[derive(Debug, Clone)]
pub struct TraceStore {
    dir: PathBuf,
}

impl TraceStore {
    /// Open `dir`, creating it (and its parents) when missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the trace of session `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{id}{FILE_SUFFIX}"))
    }

    /// Write `trace`, replacing any earlier file for the same session.
    pub fn save(&self, trace: &SessionTrace) -> Result<PathBuf, RecorderError> {
        let path = self.path_for(&trace.id);
        let body = serde_json::to_string_pretty(trace)?;
        fs::write(&path, body)?;
        debug!(path = %path.display(), "session trace written");
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<SessionTrace, RecorderError> {
        let body = match fs::read_to_string(self.path_for(id)) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RecorderError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&body)?)
    }

    /// Session ids present in the store, sorted.
    pub fn list(&self) -> Result<Vec<String>, RecorderError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
