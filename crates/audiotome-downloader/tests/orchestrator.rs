//! End-to-end orchestrator behaviour against the scripted engine.
//!
//! Every test runs on a paused Tokio clock, so monitor ticks, backoff
//! delays, and purge timers elapse in virtual time.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use audiotome_downloader::{
    Collaborators, DownloadError, DownloadOrchestrator, DownloadSource, DownloaderConfig,
    JsonSessionStore, NotificationSink, SessionStore,
};
use audiotome_events::{SessionSnapshot, SessionStatus};
use audiotome_test_support::{ExchangeScript, ScriptedEngine, ScriptedTask};
use audiotome_torrent::{MetadataPayload, PeerAddress, PeerSource, TaskError, TorrentEngine};
use tempfile::TempDir;
use uuid::Uuid;

const INFO_HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

fn torrent_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"d8:announce26:udp://tracker.example:6969");
    bytes.extend_from_slice(
        b"4:infod6:lengthi1048576e4:name6:sample12:piece lengthi16384e6:pieces20:",
    );
    bytes.extend_from_slice(&[0xAA; 20]);
    bytes.extend_from_slice(b"ee");
    bytes
}

fn metainfo_source() -> DownloadSource {
    DownloadSource::Metainfo {
        bytes: torrent_bytes(),
    }
}

fn magnet_source() -> DownloadSource {
    DownloadSource::Magnet {
        uri: format!("magnet:?xt=urn:btih:{INFO_HASH}&dn=Sample&tr=udp%3A%2F%2Fbackup.example%3A1337"),
    }
}

struct RecordingSink {
    progress_calls: AtomicU32,
    cancelled: Mutex<Vec<Uuid>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            progress_calls: AtomicU32::new(0),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    fn cancelled_ids(&self) -> Vec<Uuid> {
        self.cancelled.lock().expect("cancelled").clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn show_progress(&self, _snapshot: &SessionSnapshot) {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn cancel(&self, session_id: Uuid) {
        self.cancelled.lock().expect("cancelled").push(session_id);
    }
}

struct Harness {
    engine: Arc<ScriptedEngine>,
    store: Arc<JsonSessionStore>,
    orchestrator: DownloadOrchestrator,
    sink: Arc<RecordingSink>,
    save_root: PathBuf,
    _store_dir: TempDir,
    _save_dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::with_engine(ScriptedEngine::new()).await
    }

    async fn with_engine(engine: Arc<ScriptedEngine>) -> Self {
        let store_dir = tempfile::tempdir().expect("store dir");
        let save_dir = tempfile::tempdir().expect("save dir");
        let store = Arc::new(JsonSessionStore::new(store_dir.path()));
        store.ensure_initialized().await.expect("store init");
        let sink = RecordingSink::new();
        let collaborators = Collaborators {
            notifications: Arc::clone(&sink) as Arc<dyn NotificationSink>,
            ..Collaborators::default()
        };
        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&engine) as Arc<dyn TorrentEngine>,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            DownloaderConfig::default(),
            collaborators,
        );
        let save_root = save_dir.path().to_path_buf();
        Self {
            engine,
            store,
            orchestrator,
            sink,
            save_root,
            _store_dir: store_dir,
            _save_dir: save_dir,
        }
    }

    fn save_path(&self, name: &str) -> PathBuf {
        self.save_root.join(name)
    }

    async fn wait_for<F>(&self, what: &str, mut condition: F)
    where
        F: FnMut(&[SessionSnapshot]) -> bool,
    {
        for _ in 0..1_000 {
            let snapshots = self.orchestrator.list_sessions().await;
            if condition(&snapshots) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_for_status(&self, session_id: Uuid, status: SessionStatus) {
        self.wait_for(status.label(), |snapshots| {
            snapshots
                .iter()
                .any(|snapshot| snapshot.id == session_id && snapshot.status == status)
        })
        .await;
    }

    /// Wait until the start pipeline has attached its task; the payload size
    /// lands on the session at that point.
    async fn wait_for_transfer(&self, session_id: Uuid) {
        self.wait_for("transfer attach", |snapshots| {
            snapshots.iter().any(|snapshot| {
                snapshot.id == session_id
                    && snapshot.status == SessionStatus::Downloading
                    && snapshot.total_bytes > 0
            })
        })
        .await;
    }

    fn only_task(&self) -> Arc<ScriptedTask> {
        let tasks = self.engine.created_tasks();
        assert_eq!(tasks.len(), 1, "expected exactly one task");
        Arc::clone(&tasks[0])
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_completes_and_purges_after_grace() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    task.push_progress(0.5, 2_048, 4, 6);
    task.push_progress(0.3, 1_024, 4, 6); // engine briefly reports less
    task.push_progress(1.0, 0, 4, 6);
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    let mut stream = harness.orchestrator.progress_stream(id).expect("stream");

    let mut observed = Vec::new();
    while let Some(snapshot) = stream.next().await {
        observed.push(snapshot);
    }

    let terminal = observed.last().expect("snapshots");
    assert_eq!(terminal.status, SessionStatus::Completed);
    assert!((terminal.progress_percent - 100.0).abs() < f64::EPSILON);
    for pair in observed.windows(2) {
        assert!(
            pair[1].progress_percent >= pair[0].progress_percent,
            "progress must never decrease: {} then {}",
            pair[0].progress_percent,
            pair[1].progress_percent
        );
    }

    harness
        .wait_for("task disposal", |_| task.dispose_calls() == 1)
        .await;
    assert!(harness.sink.cancelled_ids().contains(&id));

    // The completed session lingers briefly, then is purged everywhere.
    harness
        .wait_for("completed purge", |snapshots| snapshots.is_empty())
        .await;
    assert!(harness.store.list_all().await.expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn magnet_pipeline_feeds_exchange_results_into_the_task() {
    let harness = Harness::new().await;
    harness.engine.push_exchange(ExchangeScript::Resolve(MetadataPayload {
        metadata: torrent_bytes(),
        peers: vec![PeerAddress {
            address: "198.51.100.7:6881".to_owned(),
            source: PeerSource::MetadataExchange,
        }],
    }));

    let id = harness
        .orchestrator
        .start(magnet_source(), harness.save_path("magnet-book"), None, None)
        .await
        .expect("start");
    harness.wait_for_status(id, SessionStatus::Downloading).await;

    let specs = harness.engine.created_specs();
    assert_eq!(specs.len(), 1);
    assert!(specs[0].sequential, "audiobooks download sequentially");
    assert!(specs[0].trackers.iter().any(|t| t == "udp://tracker.example:6969"));
    assert!(specs[0].trackers.iter().any(|t| t == "udp://backup.example:1337"));

    let task = harness.only_task();
    assert_eq!(task.start_calls(), 1);
    assert_eq!(task.added_peers().len(), 1);
    assert_eq!(task.added_peers()[0].address, "198.51.100.7:6881");
    assert!(harness.engine.all_exchanges_closed());
}

#[tokio::test(start_paused = true)]
async fn metadata_timeout_fails_the_session() {
    let harness = Harness::new().await;
    harness.engine.push_exchange(ExchangeScript::Never);

    let id = harness
        .orchestrator
        .start(magnet_source(), harness.save_path("stuck"), None, None)
        .await
        .expect("start");

    harness.wait_for_status(id, SessionStatus::Failed).await;
    let snapshots = harness.orchestrator.list_sessions().await;
    let failed = snapshots.iter().find(|s| s.id == id).expect("session");
    assert_eq!(
        failed.last_error.as_deref(),
        Some("metadata acquisition timed out")
    );
    assert!(harness.engine.all_exchanges_closed());
}

#[tokio::test(start_paused = true)]
async fn invalid_sources_fail_before_any_session_exists() {
    let harness = Harness::new().await;

    let err = harness
        .orchestrator
        .start(
            DownloadSource::Magnet {
                uri: "https://example.com/book".to_owned(),
            },
            harness.save_path("never"),
            None,
            None,
        )
        .await
        .expect_err("bad magnet");
    assert!(matches!(err, DownloadError::InvalidSource { .. }));

    assert!(harness.orchestrator.list_sessions().await.is_empty());
    assert!(harness.store.list_all().await.expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_drive_the_task_and_status() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    task.push_progress(0.4, 4_096, 2, 3);
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness.wait_for_transfer(id).await;

    harness.orchestrator.pause(id).await.expect("pause");
    assert_eq!(task.stop_calls(), 1);
    harness.wait_for_status(id, SessionStatus::Paused).await;

    // Paused snapshots report no transfer activity.
    let snapshots = harness.orchestrator.list_sessions().await;
    let paused = snapshots.iter().find(|s| s.id == id).expect("session");
    assert_eq!(paused.download_speed_bps, 0);
    assert!(paused.progress_percent >= 40.0, "progress is retained");

    // Pausing twice is rejected, not silently absorbed.
    let err = harness.orchestrator.pause(id).await.expect_err("double pause");
    assert!(matches!(err, DownloadError::InvalidTransition { .. }));

    harness.orchestrator.resume(id).await.expect("resume");
    assert_eq!(task.start_calls(), 2);
    harness.wait_for_status(id, SessionStatus::Downloading).await;
}

#[tokio::test(start_paused = true)]
async fn remove_is_idempotent_and_tears_everything_down() {
    let harness = Harness::new().await;
    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness.wait_for_transfer(id).await;
    let task = harness.only_task();

    harness.orchestrator.remove(id).await.expect("remove");
    harness.orchestrator.remove(id).await.expect("second remove");
    harness
        .orchestrator
        .remove(Uuid::new_v4())
        .await
        .expect("unknown remove");

    assert!(harness.orchestrator.list_sessions().await.is_empty());
    assert_eq!(task.dispose_calls(), 1);
    assert!(harness.store.list_all().await.expect("list").is_empty());
    assert!(harness.sink.cancelled_ids().contains(&id));
    let err = harness
        .orchestrator
        .progress_stream(id)
        .err()
        .expect("stream gone");
    assert!(matches!(err, DownloadError::SessionNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn pause_issued_during_startup_wins_over_the_pipeline() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    task.hold_starts();
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness
        .wait_for("task creation", |_| !harness.engine.created_tasks().is_empty())
        .await;

    // The pipeline is blocked inside the engine start call; the pause lands
    // before the task is attached.
    harness.orchestrator.pause(id).await.expect("pause");
    task.release_starts();

    harness.wait_for_status(id, SessionStatus::Paused).await;
    harness
        .wait_for("startup stop", |_| task.stop_calls() == 1)
        .await;
    assert_eq!(task.start_calls(), 1);

    harness.orchestrator.resume(id).await.expect("resume");
    harness
        .wait_for("resumed start", |_| task.start_calls() == 2)
        .await;
    harness.wait_for_status(id, SessionStatus::Downloading).await;
}

#[tokio::test(start_paused = true)]
async fn remove_during_startup_still_disposes_the_engine_task() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    task.hold_starts();
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness
        .wait_for("task creation", |_| !harness.engine.created_tasks().is_empty())
        .await;

    harness.orchestrator.remove(id).await.expect("remove");
    assert!(harness.orchestrator.list_sessions().await.is_empty());
    task.release_starts();

    // The detached pipeline finds the session gone and releases the task.
    harness
        .wait_for("task disposal", |_| task.dispose_calls() == 1)
        .await;
    assert_eq!(task.stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_near_complete_transfer_is_forced_complete() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    // Stuck at 99.2% with peers connected but nothing moving.
    task.push_progress(0.992, 0, 3, 5);
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    let mut stream = harness.orchestrator.progress_stream(id).expect("stream");

    let mut terminal = None;
    while let Some(snapshot) = stream.next().await {
        terminal = Some(snapshot);
    }
    let terminal = terminal.expect("snapshots");
    assert_eq!(terminal.status, SessionStatus::Completed);
    assert!((terminal.progress_percent - 100.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn read_failures_retry_with_backoff_until_the_ceiling() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    for _ in 0..600 {
        task.push_error(TaskError::Network {
            operation: "snapshot",
            message: "tracker unreachable".to_owned(),
        });
    }
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness.wait_for_transfer(id).await;
    let mut stream = harness.orchestrator.progress_stream(id).expect("stream");

    let mut saw_retry = false;
    let mut terminal = None;
    while let Some(snapshot) = stream.next().await {
        if snapshot.retry_cause.is_some() {
            saw_retry = true;
            assert_eq!(
                snapshot.human_status(),
                "retrying: tracker unreachable",
                "retry cause surfaces in the display status"
            );
        }
        terminal = Some(snapshot);
    }

    assert!(saw_retry, "at least one retry snapshot published");
    let terminal = terminal.expect("snapshots");
    assert_eq!(terminal.status, SessionStatus::Failed);
    let error = terminal.last_error.expect("failure cause");
    assert!(error.contains("3 retries"), "unexpected error: {error}");

    // One initial start plus one restart per consumed retry.
    assert_eq!(task.start_calls(), 4);
    assert_eq!(task.dispose_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn prolonged_idle_transfer_surfaces_a_network_loss_retry() {
    let harness = Harness::new().await;
    let task = ScriptedTask::new();
    // Default snapshot: zero progress, zero speed, zero peers.
    harness.engine.push_task(Arc::clone(&task));

    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness
        .wait_for("network loss retry", |snapshots| {
            snapshots.iter().any(|snapshot| {
                snapshot.id == id
                    && snapshot.human_status() == "retrying: network connection lost"
            })
        })
        .await;
    harness.orchestrator.remove(id).await.expect("remove");
}

#[tokio::test(start_paused = true)]
async fn sessions_survive_a_process_restart() {
    let store_dir = tempfile::tempdir().expect("store dir");
    let save_dir = tempfile::tempdir().expect("save dir");
    let save_path = save_dir.path().join("book");
    let store = Arc::new(JsonSessionStore::new(store_dir.path()));
    store.ensure_initialized().await.expect("store init");

    // First process: start a download, then shut down mid-transfer.
    let id = {
        let engine = ScriptedEngine::new();
        let task = ScriptedTask::new();
        task.push_progress(0.6, 8_192, 3, 4);
        engine.push_task(Arc::clone(&task));
        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&engine) as Arc<dyn TorrentEngine>,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            DownloaderConfig::default(),
            Collaborators::default(),
        );
        let id = orchestrator
            .start(metainfo_source(), save_path.clone(), None, None)
            .await
            .expect("start");
        for _ in 0..1_000 {
            let snapshots = orchestrator.list_sessions().await;
            if snapshots
                .iter()
                .any(|s| s.id == id && s.progress_percent >= 60.0)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        orchestrator.shutdown().await;
        assert_eq!(task.dispose_calls(), 1);
        id
    };

    // Second process: restore from the store.
    let engine = ScriptedEngine::new();
    let orchestrator = DownloadOrchestrator::new(
        Arc::clone(&engine) as Arc<dyn TorrentEngine>,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        DownloaderConfig::default(),
        Collaborators::default(),
    );
    let restored = orchestrator.restore().await.expect("restore");
    assert_eq!(restored, 1);

    let snapshots = orchestrator.list_sessions().await;
    let session = snapshots.iter().find(|s| s.id == id).expect("restored");
    assert_eq!(session.status, SessionStatus::Downloading);
    assert!(!session.is_active, "no live task backs a restored session");
    assert!(session.progress_percent >= 60.0, "progress preserved");

    // Restarting relaunches the pipeline on the new engine.
    orchestrator.restart(id).await.expect("restart");
    for _ in 0..1_000 {
        if engine.created_tasks().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    let task = &engine.created_tasks()[0];
    assert_eq!(task.start_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn restore_drops_sessions_whose_directory_vanished() {
    let store_dir = tempfile::tempdir().expect("store dir");
    let save_dir = tempfile::tempdir().expect("save dir");
    let save_path = save_dir.path().join("book");
    let store = Arc::new(JsonSessionStore::new(store_dir.path()));
    store.ensure_initialized().await.expect("store init");

    {
        let engine = ScriptedEngine::new();
        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&engine) as Arc<dyn TorrentEngine>,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            DownloaderConfig::default(),
            Collaborators::default(),
        );
        orchestrator
            .start(metainfo_source(), save_path.clone(), None, None)
            .await
            .expect("start");
        orchestrator.shutdown().await;
    }
    tokio::fs::remove_dir_all(&save_path).await.expect("remove dir");

    let engine = ScriptedEngine::new();
    let orchestrator = DownloadOrchestrator::new(
        Arc::clone(&engine) as Arc<dyn TorrentEngine>,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        DownloaderConfig::default(),
        Collaborators::default(),
    );
    let restored = orchestrator.restore().await.expect("restore");
    assert_eq!(restored, 0);
    assert!(orchestrator.list_sessions().await.is_empty());
    assert!(store.list_all().await.expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn redownload_issues_a_fresh_session_id() {
    let harness = Harness::new().await;
    let id = harness
        .orchestrator
        .start(metainfo_source(), harness.save_path("book"), None, None)
        .await
        .expect("start");
    harness.wait_for_transfer(id).await;
    let first_task = harness.only_task();

    let new_id = harness.orchestrator.redownload(id).await.expect("redownload");
    assert_ne!(new_id, id, "redownload creates a fresh session");
    assert_eq!(first_task.dispose_calls(), 1, "old task released");

    harness
        .wait_for_status(new_id, SessionStatus::Downloading)
        .await;
    let snapshots = harness.orchestrator.list_sessions().await;
    assert!(snapshots.iter().all(|s| s.id != id), "old session gone");
    assert!(snapshots.iter().any(|s| s.id == new_id));

    let stored = harness.store.list_all().await.expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, new_id);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_calls_on_unknown_sessions_report_not_found() {
    let harness = Harness::new().await;
    let unknown = Uuid::new_v4();

    for err in [
        harness.orchestrator.pause(unknown).await.expect_err("pause"),
        harness.orchestrator.resume(unknown).await.expect_err("resume"),
        harness.orchestrator.restart(unknown).await.expect_err("restart"),
        harness
            .orchestrator
            .redownload(unknown)
            .await
            .map(|_| ())
            .expect_err("redownload"),
    ] {
        assert!(matches!(err, DownloadError::SessionNotFound { .. }));
    }
}
