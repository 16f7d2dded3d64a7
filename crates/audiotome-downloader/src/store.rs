//! Crash-safe session persistence.
//!
//! Sessions serialize to one JSON document per session under a root
//! directory. Writes go through a temp file and an atomic rename so a crash
//! mid-write never corrupts an existing record. Corrupt documents found
//! during a scan are skipped with a warning rather than failing restoration.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::model::Session;

const SESSION_SUFFIX: &str = ".session.json";
const TEMP_SUFFIX: &str = ".session.json.tmp";

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by session persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("session store io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A session document failed to (de)serialize.
    #[error("session document serialization failure")]
    Json {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Durable storage for [`Session`] records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist the session, replacing any existing record.
    async fn save(&self, session: &Session) -> StoreResult<()>;

    /// Delete the session's record. Deleting a missing record is a no-op.
    async fn delete(&self, session_id: Uuid) -> StoreResult<()>;

    /// Load every readable session record.
    async fn list_all(&self) -> StoreResult<Vec<Session>>;
}

/// File-per-session JSON store.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    root: PathBuf,
}

impl JsonSessionStore {
    /// Create a store rooted at `root`. Call [`Self::ensure_initialized`]
    /// before first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be created.
    pub async fn ensure_initialized(&self) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                operation: "create_dir_all",
                path: self.root.clone(),
                source,
            })
    }

    fn session_path(&self, session_id: Uuid) -> PathBuf {
        self.root.join(format!("{session_id}{SESSION_SUFFIX}"))
    }

    fn temp_path(&self, session_id: Uuid) -> PathBuf {
        self.root.join(format!("{session_id}{TEMP_SUFFIX}"))
    }

    async fn read_session(path: &Path) -> StoreResult<Session> {
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            operation: "read",
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            operation: "deserialize",
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save(&self, session: &Session) -> StoreResult<()> {
        let path = self.session_path(session.id);
        let temp = self.temp_path(session.id);
        let bytes = serde_json::to_vec_pretty(session).map_err(|source| StoreError::Json {
            operation: "serialize",
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                operation: "write",
                path: temp.clone(),
                source,
            })?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|source| StoreError::Io {
                operation: "rename",
                path,
                source,
            })
    }

    async fn delete(&self, session_id: Uuid) -> StoreResult<()> {
        let path = self.session_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                operation: "remove_file",
                path,
                source,
            }),
        }
    }

    async fn list_all(&self) -> StoreResult<Vec<Session>> {
        let mut entries =
            tokio::fs::read_dir(&self.root)
                .await
                .map_err(|source| StoreError::Io {
                    operation: "read_dir",
                    path: self.root.clone(),
                    source,
                })?;
        let mut sessions = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                operation: "next_entry",
                path: self.root.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(SESSION_SUFFIX) {
                continue;
            }
            match Self::read_session(&path).await {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable session record");
                }
            }
        }
        Ok(sessions)
    }
}
