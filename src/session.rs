//! Session registry: identity, expiry, and on-disk layout.
//!
//! Each session owns one directory under the storage root:
//!
//! ```text
//! <root>/<session_id>/
//!   session.json        {created_at, last_access} ISO-8601
//!   files/<doc>.pdf     raw upload
//!   chunks/<doc>.json   chunk texts, JSON array of strings
//!   indices/<doc>.index vector index, opaque binary
//!   history.json        conversation log (optional)
//! ```
//!
//! The directory tree is the unit of isolation: two sessions never share
//! files, so concurrent operations on different sessions never contend.
//! A session idle past [`SESSION_IDLE_TIMEOUT`] is expired; validation and
//! the last-access refresh are a single logical step so a session judged
//! valid cannot expire before the caller uses it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{RagError, Result};

/// Idle threshold after which a session expires. Fixed for all sessions.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct SessionMeta {
    created_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

/// Owns session identity and the per-session directory tree. Injected into
/// the pipelines rather than accessed as ambient state, so tests can run
/// isolated instances with short timeouts.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    root: PathBuf,
    idle_timeout: chrono::Duration,
}

impl SessionRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_idle_timeout(root, SESSION_IDLE_TIMEOUT)
    }

    /// Registry with a custom idle timeout. Test seam for expiry behavior.
    pub fn with_idle_timeout(root: impl Into<PathBuf>, idle_timeout: Duration) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        })
    }

    /// Allocate a fresh session: unique id, directory tree, timestamps.
    pub fn create(&self) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let dir = self.root.join(&session_id);
        fs::create_dir_all(dir.join("files"))?;
        fs::create_dir_all(dir.join("chunks"))?;
        fs::create_dir_all(dir.join("indices"))?;

        let now = Utc::now();
        self.write_meta(
            &session_id,
            &SessionMeta {
                created_at: now,
                last_access: now,
            },
        )?;

        tracing::info!(session_id = %session_id, "created session");
        Ok(session_id)
    }

    /// Validate a session and refresh its last-access time in one step.
    ///
    /// Returns false for unknown or malformed ids. An expired or corrupt
    /// session is deleted during validation and reported invalid.
    pub fn validate(&self, session_id: &str) -> bool {
        if !is_safe_id(session_id) {
            return false;
        }
        let meta = match self.read_meta(session_id) {
            Ok(Some(meta)) => meta,
            Ok(None) => return false,
            Err(_) => {
                // Unreadable metadata counts as expired.
                tracing::warn!(session_id = %session_id, "corrupt session metadata, deleting");
                self.delete(session_id);
                return false;
            }
        };

        if Utc::now() - meta.last_access > self.idle_timeout {
            tracing::info!(session_id = %session_id, "session expired");
            self.delete(session_id);
            return false;
        }

        self.touch(session_id)
    }

    /// Refresh last-access only. Returns false if the session is gone.
    pub fn touch(&self, session_id: &str) -> bool {
        if !is_safe_id(session_id) {
            return false;
        }
        let mut meta = match self.read_meta(session_id) {
            Ok(Some(meta)) => meta,
            _ => return false,
        };
        meta.last_access = Utc::now();
        self.write_meta(session_id, &meta).is_ok()
    }

    /// Delete a session's directory tree. Idempotent: a missing or already
    /// deleted session is a no-op.
    pub fn delete(&self, session_id: &str) {
        if !is_safe_id(session_id) {
            return;
        }
        let dir = self.root.join(session_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => tracing::info!(session_id = %session_id, "deleted session"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(session_id = %session_id, error = %e, "session delete failed"),
        }
    }

    /// Delete every session past the idle threshold or with unreadable
    /// metadata. Returns the number removed. Per-entry failures are logged
    /// and skipped; the pass itself only fails if the root is unreadable.
    pub fn sweep(&self) -> Result<usize> {
        let mut removed = 0usize;
        let now = Utc::now();

        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.path().is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();

            let expired = match self.read_meta(&session_id) {
                Ok(Some(meta)) => now - meta.last_access > self.idle_timeout,
                // Missing or corrupt metadata: implicit expiry.
                Ok(None) | Err(_) => true,
            };

            if expired {
                self.delete(&session_id);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "sweep removed expired sessions");
        }
        Ok(removed)
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn file_path(&self, session_id: &str, document_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("files")
            .join(format!("{}.pdf", document_id))
    }

    pub fn chunks_path(&self, session_id: &str, document_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("chunks")
            .join(format!("{}.json", document_id))
    }

    pub fn index_path(&self, session_id: &str, document_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("indices")
            .join(format!("{}.index", document_id))
    }

    pub fn history_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("history.json")
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    /// `Ok(None)` means the session does not exist; `Err` means it exists
    /// but its metadata is unreadable.
    fn read_meta(&self, session_id: &str) -> Result<Option<SessionMeta>> {
        let content = match fs::read_to_string(self.meta_path(session_id)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = serde_json::from_str(&content)
            .map_err(|e| RagError::CorruptArtifact(format!("session.json: {}", e)))?;
        Ok(Some(meta))
    }

    fn write_meta(&self, session_id: &str, meta: &SessionMeta) -> Result<()> {
        let json = serde_json::to_string(meta)
            .map_err(|e| RagError::CorruptArtifact(format!("session.json: {}", e)))?;
        fs::write(self.meta_path(session_id), json)?;
        Ok(())
    }
}

/// Session ids become directory names; reject anything that could escape
/// the storage root.
pub(crate) fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains("..")
}
