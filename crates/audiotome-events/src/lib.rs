//! Per-session progress streaming for the Audiotome download pipeline.
//!
//! Each download session owns a broadcast channel carrying [`SessionSnapshot`]
//! values in tick order. The orchestrator publishes the final snapshot for a
//! terminal state and then closes the channel, so subscribers never observe a
//! snapshot after a terminal one. Internally this uses `tokio::broadcast`;
//! slow subscribers skip ahead when they lag instead of stalling publishers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default broadcast capacity for a single session channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle states a download session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Resolving a magnet link into raw torrent metadata.
    AcquiringMetadata,
    /// Actively transferring pieces.
    Downloading,
    /// Transfer suspended by the caller.
    Paused,
    /// All bytes received and verified (or completion was forced).
    Completed,
    /// Terminally failed; see the session's `last_error`.
    Failed,
    /// Removed by explicit caller action.
    Removed,
}

impl SessionStatus {
    /// Human-readable label for UI rendering.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::AcquiringMetadata => "acquiring metadata",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }

    /// Whether the state is terminal; no snapshot follows a terminal one.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }
}

/// Point-in-time view of a session delivered on its progress stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub id: Uuid,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Cause of an in-flight automatic retry, when one is pending.
    pub retry_cause: Option<String>,
    /// Optional display title.
    pub title: Option<String>,
    /// Target directory for the download.
    pub save_path: String,
    /// Completion percentage in the range 0–100.
    pub progress_percent: f64,
    /// Bytes received so far.
    pub downloaded_bytes: u64,
    /// Total payload size, zero until metadata is known.
    pub total_bytes: u64,
    /// Current download rate in bytes per second.
    pub download_speed_bps: u64,
    /// Current upload rate in bytes per second.
    pub upload_speed_bps: u64,
    /// Peers holding the complete file set.
    pub seeder_count: u64,
    /// Peers still downloading.
    pub leecher_count: u64,
    /// Whether a live task is backing this session in the current process.
    pub is_active: bool,
    /// Most recent failure description, if any.
    pub last_error: Option<String>,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Status string for display, surfacing transient retry state.
    #[must_use]
    pub fn human_status(&self) -> String {
        self.retry_cause.as_ref().map_or_else(
            || self.status.label().to_owned(),
            |cause| format!("retrying: {cause}"),
        )
    }
}

/// Registry of per-session broadcast channels.
///
/// The hub hands out [`SnapshotStream`]s that yield snapshots in publish
/// order and end once the session's channel is closed.
#[derive(Clone)]
pub struct SnapshotHub {
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<SessionSnapshot>>>>,
    capacity: usize,
}

impl SnapshotHub {
    /// Construct a hub whose channels buffer `capacity` snapshots each.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "snapshot channel capacity must be positive");
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Construct a hub with the default per-channel buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Open a channel for the session, if one is not already open.
    ///
    /// # Panics
    ///
    /// Panics if the channel registry mutex has been poisoned.
    pub fn open(&self, session_id: Uuid) {
        let mut channels = self.channels.lock().expect("snapshot hub mutex poisoned");
        channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Publish a snapshot to the session's channel.
    ///
    /// Publishing to a closed or never-opened channel is a no-op, as is
    /// publishing with no live subscribers.
    ///
    /// # Panics
    ///
    /// Panics if the channel registry mutex has been poisoned.
    pub fn publish(&self, snapshot: SessionSnapshot) {
        let channels = self.channels.lock().expect("snapshot hub mutex poisoned");
        if let Some(sender) = channels.get(&snapshot.id) {
            let _ = sender.send(snapshot);
        }
    }

    /// Subscribe to a session's stream; `None` when no live channel exists.
    ///
    /// # Panics
    ///
    /// Panics if the channel registry mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, session_id: Uuid) -> Option<SnapshotStream> {
        let channels = self.channels.lock().expect("snapshot hub mutex poisoned");
        channels.get(&session_id).map(|sender| SnapshotStream {
            receiver: sender.subscribe(),
        })
    }

    /// Whether the session currently has an open channel.
    ///
    /// # Panics
    ///
    /// Panics if the channel registry mutex has been poisoned.
    #[must_use]
    pub fn is_open(&self, session_id: Uuid) -> bool {
        let channels = self.channels.lock().expect("snapshot hub mutex poisoned");
        channels.contains_key(&session_id)
    }

    /// Close the session's channel, terminating all subscribed streams.
    ///
    /// # Panics
    ///
    /// Panics if the channel registry mutex has been poisoned.
    pub fn close(&self, session_id: Uuid) {
        let mut channels = self.channels.lock().expect("snapshot hub mutex poisoned");
        channels.remove(&session_id);
    }

    /// Close every channel, terminating all subscribed streams.
    ///
    /// # Panics
    ///
    /// Panics if the channel registry mutex has been poisoned.
    pub fn close_all(&self) {
        let mut channels = self.channels.lock().expect("snapshot hub mutex poisoned");
        channels.clear();
    }
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of snapshots for a single session.
pub struct SnapshotStream {
    receiver: broadcast::Receiver<SessionSnapshot>,
}

impl SnapshotStream {
    /// Receive the next snapshot; `None` once the channel is closed.
    ///
    /// A lagged subscriber skips to the oldest retained snapshot rather than
    /// failing.
    pub async fn next(&mut self) -> Option<SessionSnapshot> {
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
