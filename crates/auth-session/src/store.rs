//! Durable token storage
//!
//! Manages a JSON file mapping session ids to token records so a session can
//! be restored after the host restarts. All writes use atomic temp-file +
//! rename to prevent corruption on crash. A tokio Mutex serializes concurrent
//! writes from request-time refresh and the proactive refresh task.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use provider::TokenRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::{StoreFuture, TokenStore};
use crate::error::{Error, Result};
use crate::session::SessionId;

/// On-disk shape of a token record.
///
/// Timestamps are unix milliseconds, as in `TokenRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
    expires_at: u64,
    issued_at: u64,
}

impl From<&TokenRecord> for StoredToken {
    fn from(record: &TokenRecord) -> Self {
        Self {
            access_token: record.access_token.expose().clone(),
            refresh_token: record.refresh_token.as_ref().map(|t| t.expose().clone()),
            id_token: record.id_token.as_ref().map(|t| t.expose().clone()),
            expires_at: record.expires_at,
            issued_at: record.issued_at,
        }
    }
}

impl From<StoredToken> for TokenRecord {
    fn from(stored: StoredToken) -> Self {
        let mut record = TokenRecord::new(stored.access_token, stored.issued_at, stored.expires_at);
        if let Some(refresh) = stored.refresh_token {
            record = record.with_refresh_token(refresh);
        }
        if let Some(id_token) = stored.id_token {
            record = record.with_id_token(id_token);
        }
        record
    }
}

/// File-backed `TokenStore`.
///
/// The in-memory map is the read path; every mutation rewrites the file.
pub struct FileTokenStore {
    path: PathBuf,
    state: Mutex<HashMap<SessionId, TokenRecord>>,
}

impl FileTokenStore {
    /// Load records from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start, no
    /// sessions to restore).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading token file: {e}")))?;
            let stored: HashMap<SessionId, StoredToken> = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing token file: {e}")))?;
            info!(path = %path.display(), sessions = stored.len(), "loaded token records");
            stored
                .into_iter()
                .map(|(id, token)| (id, TokenRecord::from(token)))
                .collect()
        } else {
            info!(path = %path.display(), "token file not found, starting with empty store");
            let state = HashMap::new();
            // Create the empty file so future loads don't need the cold-start path
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TokenStore for FileTokenStore {
    fn put<'a>(&'a self, session_id: &'a SessionId, record: TokenRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(session_id.clone(), record);
            debug!(session_id = %session_id, "stored token record");
            write_atomic(&self.path, &state).await
        })
    }

    fn get<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Option<TokenRecord>> + Send + 'a>> {
        Box::pin(async move { self.state.lock().await.get(session_id).cloned() })
    }

    /// The in-memory entry is removed before the file is rewritten, so a
    /// failed write still leaves the record unreadable.
    fn invalidate<'a>(&'a self, session_id: &'a SessionId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(session_id).is_some() {
                debug!(session_id = %session_id, "removed token record");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write records to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bearer and refresh tokens.
async fn write_atomic(path: &Path, data: &HashMap<SessionId, TokenRecord>) -> Result<()> {
    let stored: HashMap<&SessionId, StoredToken> = data
        .iter()
        .map(|(id, record)| (id, StoredToken::from(record)))
        .collect();
    let json = serde_json::to_string_pretty(&stored)
        .map_err(|e| Error::Storage(format!("serializing token records: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("token file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token records");
    Ok(())
}
