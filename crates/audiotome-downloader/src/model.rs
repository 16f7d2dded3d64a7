//! Durable session record.
//!
//! A [`Session`] is the persisted state of one download: its source, target
//! directory, lifecycle status and last observed transfer counters. Retry
//! bookkeeping is process-local and deliberately excluded from serialization,
//! so a restored session always starts with a clean retry budget.

use std::path::PathBuf;

use audiotome_events::{SessionSnapshot, SessionStatus};
use audiotome_torrent::TaskSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a session's torrent payload comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadSource {
    /// A magnet URI that must be resolved into metadata before transfer.
    Magnet {
        /// The full `magnet:?...` URI.
        uri: String,
    },
    /// Raw bencoded torrent file contents.
    Metainfo {
        /// The `.torrent` file bytes.
        #[serde(with = "serde_bytes_base64")]
        bytes: Vec<u8>,
    },
}

impl DownloadSource {
    /// Short label used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Magnet { .. } => "magnet",
            Self::Metainfo { .. } => "metainfo",
        }
    }

    /// Initial status for a session created from this source.
    #[must_use]
    pub const fn initial_status(&self) -> SessionStatus {
        match self {
            Self::Magnet { .. } => SessionStatus::AcquiringMetadata,
            Self::Metainfo { .. } => SessionStatus::Downloading,
        }
    }
}

/// Base64 (de)serialization for raw torrent bytes inside JSON documents.
mod serde_bytes_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(D::Error::custom)
    }
}

/// Persisted state of one download session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable session identifier.
    pub id: Uuid,
    /// Source the session was created from; reused for restarts.
    pub source: DownloadSource,
    /// Target directory for the downloaded files.
    pub save_path: PathBuf,
    /// Display title; defaults to the torrent name once metadata is known.
    pub title: Option<String>,
    /// Optional cover image URL fetched on completion.
    pub cover_url: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Completion percentage in the range 0–100; never decreases.
    pub progress_percent: f64,
    /// Bytes received so far.
    pub downloaded_bytes: u64,
    /// Total payload size, zero until metadata is known.
    pub total_bytes: u64,
    /// Last observed download rate.
    pub download_speed_bps: u64,
    /// Last observed upload rate.
    pub upload_speed_bps: u64,
    /// Last observed seeder count.
    pub seeder_count: u64,
    /// Last observed leecher count.
    pub leecher_count: u64,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
    /// When the session was last paused, if it is paused.
    pub paused_at: Option<DateTime<Utc>>,
    /// When the session completed, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the session failed terminally, if it has.
    pub failed_at: Option<DateTime<Utc>>,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// Network errors absorbed since the last byte of progress.
    #[serde(skip)]
    pub retry_count: u32,
    /// Cause of the retry currently in flight, if any.
    #[serde(skip)]
    pub retry_cause: Option<String>,
    /// When the most recent network error was observed.
    #[serde(skip)]
    pub last_network_error_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a fresh session in its source's initial status.
    #[must_use]
    pub fn new(
        source: DownloadSource,
        save_path: PathBuf,
        title: Option<String>,
        cover_url: Option<String>,
    ) -> Self {
        let status = source.initial_status();
        Self {
            id: Uuid::new_v4(),
            source,
            save_path,
            title,
            cover_url,
            status,
            progress_percent: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            download_speed_bps: 0,
            upload_speed_bps: 0,
            seeder_count: 0,
            leecher_count: 0,
            started_at: Utc::now(),
            paused_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            retry_count: 0,
            retry_cause: None,
            last_network_error_at: None,
        }
    }

    /// Fold an engine snapshot into the session.
    ///
    /// Progress is clamped monotone: a snapshot reporting less progress than
    /// previously recorded updates rates and peer counts but not progress.
    pub fn record_progress(&mut self, observed: &TaskSnapshot) {
        let percent = observed.percent_complete();
        if percent > self.progress_percent {
            self.progress_percent = percent;
            self.downloaded_bytes = observed.downloaded_bytes;
        } else {
            self.downloaded_bytes = self.downloaded_bytes.max(observed.downloaded_bytes);
        }
        if observed.total_bytes > 0 {
            self.total_bytes = observed.total_bytes;
        }
        self.download_speed_bps = observed.download_speed_bps;
        self.upload_speed_bps = observed.upload_speed_bps;
        self.seeder_count = observed.seeder_count;
        self.leecher_count = observed.leecher_count();
        if self.title.is_none() {
            self.title.clone_from(&observed.name);
        }
    }

    /// Clear retry bookkeeping after observable forward progress.
    pub fn reset_retry_state(&mut self) {
        self.retry_count = 0;
        self.retry_cause = None;
        self.last_network_error_at = None;
    }

    /// Transition to [`SessionStatus::Paused`].
    pub fn mark_paused(&mut self) {
        self.status = SessionStatus::Paused;
        self.paused_at = Some(Utc::now());
        self.download_speed_bps = 0;
        self.upload_speed_bps = 0;
    }

    /// Transition back to [`SessionStatus::Downloading`].
    pub fn mark_downloading(&mut self) {
        self.status = SessionStatus::Downloading;
        self.paused_at = None;
    }

    /// Transition to [`SessionStatus::Completed`] at 100%.
    pub fn mark_completed(&mut self) {
        self.status = SessionStatus::Completed;
        self.progress_percent = 100.0;
        if self.total_bytes > 0 {
            self.downloaded_bytes = self.total_bytes;
        }
        self.download_speed_bps = 0;
        self.upload_speed_bps = 0;
        self.completed_at = Some(Utc::now());
        self.retry_cause = None;
    }

    /// Transition to [`SessionStatus::Failed`] with a cause.
    pub fn mark_failed(&mut self, error: String) {
        self.status = SessionStatus::Failed;
        self.download_speed_bps = 0;
        self.upload_speed_bps = 0;
        self.failed_at = Some(Utc::now());
        self.last_error = Some(error);
        self.retry_cause = None;
    }

    /// Build the stream-facing snapshot of this session.
    #[must_use]
    pub fn snapshot(&self, is_active: bool) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            status: self.status,
            retry_cause: self.retry_cause.clone(),
            title: self.title.clone(),
            save_path: self.save_path.to_string_lossy().into_owned(),
            progress_percent: self.progress_percent,
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            download_speed_bps: self.download_speed_bps,
            upload_speed_bps: self.upload_speed_bps,
            seeder_count: self.seeder_count,
            leecher_count: self.leecher_count,
            is_active,
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_snapshot(progress: f64, downloaded: u64) -> TaskSnapshot {
        TaskSnapshot {
            progress,
            downloaded_bytes: downloaded,
            total_bytes: 1_000,
            download_speed_bps: 512,
            upload_speed_bps: 16,
            seeder_count: 4,
            peer_count: 7,
            name: Some("Sample Audiobook".to_owned()),
        }
    }

    fn magnet_session() -> Session {
        Session::new(
            DownloadSource::Magnet {
                uri: "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a".to_owned(),
            },
            PathBuf::from("/tmp/books/sample"),
            None,
            None,
        )
    }

    #[test]
    fn initial_status_follows_source() {
        assert_eq!(magnet_session().status, SessionStatus::AcquiringMetadata);

        let session = Session::new(
            DownloadSource::Metainfo { bytes: vec![0x64] },
            PathBuf::from("/tmp/books"),
            None,
            None,
        );
        assert_eq!(session.status, SessionStatus::Downloading);
    }

    #[test]
    fn progress_never_decreases() {
        let mut session = magnet_session();
        session.record_progress(&task_snapshot(0.5, 500));
        assert!((session.progress_percent - 50.0).abs() < f64::EPSILON);

        session.record_progress(&task_snapshot(0.3, 300));
        assert!((session.progress_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(session.downloaded_bytes, 500);

        session.record_progress(&task_snapshot(0.6, 600));
        assert!((session.progress_percent - 60.0).abs() < f64::EPSILON);
        assert_eq!(session.downloaded_bytes, 600);
    }

    #[test]
    fn title_defaults_to_torrent_name() {
        let mut session = magnet_session();
        session.record_progress(&task_snapshot(0.1, 100));
        assert_eq!(session.title.as_deref(), Some("Sample Audiobook"));

        let mut titled = Session::new(
            DownloadSource::Metainfo { bytes: vec![0x64] },
            PathBuf::from("/tmp/books"),
            Some("Caller Title".to_owned()),
            None,
        );
        titled.record_progress(&task_snapshot(0.1, 100));
        assert_eq!(titled.title.as_deref(), Some("Caller Title"));
    }

    #[test]
    fn retry_bookkeeping_is_not_persisted() {
        let mut session = magnet_session();
        session.retry_count = 2;
        session.retry_cause = Some("network error".to_owned());
        session.last_network_error_at = Some(Utc::now());

        let text = serde_json::to_string(&session).expect("serialize");
        let restored: Session = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(restored.retry_count, 0);
        assert!(restored.retry_cause.is_none());
        assert!(restored.last_network_error_at.is_none());
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.source, session.source);
    }

    #[test]
    fn metainfo_bytes_round_trip_through_json() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let session = Session::new(
            DownloadSource::Metainfo {
                bytes: bytes.clone(),
            },
            PathBuf::from("/tmp/books"),
            None,
            None,
        );
        let text = serde_json::to_string(&session).expect("serialize");
        let restored: Session = serde_json::from_str(&text).expect("deserialize");
        match restored.source {
            DownloadSource::Metainfo { bytes: restored } => assert_eq!(restored, bytes),
            DownloadSource::Magnet { .. } => panic!("source kind changed"),
        }
    }

    #[test]
    fn completion_pins_progress_and_bytes() {
        let mut session = magnet_session();
        session.record_progress(&task_snapshot(0.992, 992));
        session.mark_completed();
        assert!((session.progress_percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(session.downloaded_bytes, 1_000);
        assert_eq!(session.download_speed_bps, 0);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn snapshot_reflects_session_fields() {
        let mut session = magnet_session();
        session.record_progress(&task_snapshot(0.25, 250));
        session.retry_cause = Some("network error".to_owned());

        let snapshot = session.snapshot(true);
        assert_eq!(snapshot.id, session.id);
        assert!(snapshot.is_active);
        assert_eq!(snapshot.downloaded_bytes, 250);
        assert_eq!(snapshot.leecher_count, 3);
        assert_eq!(snapshot.human_status(), "retrying: network error");
    }
}
