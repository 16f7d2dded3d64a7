//! Session lifecycle orchestration.
//!
//! [`DownloadOrchestrator`] is the crate's public surface. It owns the
//! session table, launches the per-session download pipeline (metadata
//! acquisition, task creation, transfer start) and monitor loop, and runs a
//! supervisor that reacts to monitor signals: completion finalisation,
//! retry scheduling, and terminal failure.
//!
//! Locking discipline: the session table is guarded by a synchronous
//! `RwLock` and is never held across an await point. Task handles are cloned
//! out under the lock and engine calls happen after it is released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use audiotome_events::{SessionSnapshot, SessionStatus, SnapshotHub, SnapshotStream};
use audiotome_torrent::{MagnetLink, Metainfo, TaskSpec, TorrentEngine, TorrentTask};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acquire::MetadataAcquirer;
use crate::config::DownloaderConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::model::{DownloadSource, Session};
use crate::monitor;
use crate::retry::{RetryController, RetryDecision};
use crate::store::SessionStore;

/// Receives progress notifications for UI surfaces.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Called once per monitor tick with the latest snapshot.
    async fn show_progress(&self, snapshot: &SessionSnapshot);

    /// Called when a session ends for any reason.
    async fn cancel(&self, session_id: Uuid);
}

/// Triggers a library rescan after a completed download.
#[async_trait]
pub trait LibraryRescan: Send + Sync {
    /// Request a rescan of the library directories.
    async fn trigger(&self);
}

/// Fetches cover art for a completed download.
#[async_trait]
pub trait CoverFetch: Send + Sync {
    /// Fetch and store the cover image for the session.
    async fn fetch(&self, session_id: Uuid, cover_url: &str);
}

struct NoopCollaborator;

#[async_trait]
impl NotificationSink for NoopCollaborator {
    async fn show_progress(&self, _snapshot: &SessionSnapshot) {}

    async fn cancel(&self, _session_id: Uuid) {}
}

#[async_trait]
impl LibraryRescan for NoopCollaborator {
    async fn trigger(&self) {}
}

#[async_trait]
impl CoverFetch for NoopCollaborator {
    async fn fetch(&self, _session_id: Uuid, _cover_url: &str) {}
}

/// Optional integrations invoked at lifecycle boundaries.
///
/// Defaults are no-ops, so the orchestrator works standalone.
#[derive(Clone)]
pub struct Collaborators {
    /// Progress and cancellation notifications.
    pub notifications: Arc<dyn NotificationSink>,
    /// Library rescan trigger fired after completion.
    pub library: Arc<dyn LibraryRescan>,
    /// Cover art fetcher fired after completion.
    pub covers: Arc<dyn CoverFetch>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let noop = Arc::new(NoopCollaborator);
        Self {
            notifications: Arc::clone(&noop) as Arc<dyn NotificationSink>,
            library: Arc::clone(&noop) as Arc<dyn LibraryRescan>,
            covers: noop,
        }
    }
}

/// Signals the monitor loop sends to the supervisor.
#[derive(Debug)]
pub(crate) enum MonitorSignal {
    /// The session's transfer finished; run completion side effects.
    Completed {
        /// Session that completed.
        session_id: Uuid,
    },
    /// A transient network failure needs a retry decision.
    NetworkError {
        /// Session that hit the failure.
        session_id: Uuid,
        /// Human-readable cause, surfaced as the retry cause.
        cause: String,
    },
    /// The task failed unrecoverably.
    Fatal {
        /// Session that failed.
        session_id: Uuid,
        /// Failure description recorded as the session's last error.
        message: String,
    },
}

/// One session's runtime state inside the table.
struct SessionEntry {
    session: Session,
    task: Option<Arc<dyn TorrentTask>>,
    monitor: Option<JoinHandle<()>>,
    pipeline: Option<JoinHandle<()>>,
    purge: Option<JoinHandle<()>>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session,
            task: None,
            monitor: None,
            pipeline: None,
            purge: None,
        }
    }

    /// Whether a live task or in-flight pipeline backs this session.
    fn is_active(&self) -> bool {
        self.task.is_some() || self.pipeline.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn abort_background(&mut self) {
        for handle in [
            self.monitor.take(),
            self.pipeline.take(),
            self.purge.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// A download source validated up front, ready for the pipeline.
#[derive(Debug)]
enum ParsedSource {
    Magnet(MagnetLink),
    Metainfo {
        bytes: Vec<u8>,
        info: Box<Metainfo>,
    },
}

/// State shared between the orchestrator, monitors, and the supervisor.
pub(crate) struct Shared {
    engine: Arc<dyn TorrentEngine>,
    store: Arc<dyn SessionStore>,
    hub: SnapshotHub,
    config: DownloaderConfig,
    retry: RetryController,
    acquirer: MetadataAcquirer,
    collaborators: Collaborators,
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    signals: mpsc::UnboundedSender<MonitorSignal>,
}

impl Shared {
    pub(crate) const fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    fn table_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.read().expect("session table poisoned")
    }

    fn table_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.write().expect("session table poisoned")
    }

    fn read_session<T>(&self, session_id: Uuid, read: impl FnOnce(&Session) -> T) -> Option<T> {
        let sessions = self.table_read();
        sessions.get(&session_id).map(|entry| read(&entry.session))
    }

    pub(crate) fn session_status(&self, session_id: Uuid) -> Option<SessionStatus> {
        self.read_session(session_id, |session| session.status)
    }

    /// Mutate a session and return its post-mutation snapshot.
    pub(crate) fn update_session(
        &self,
        session_id: Uuid,
        mutate: impl FnOnce(&mut Session),
    ) -> Option<SessionSnapshot> {
        let mut sessions = self.table_write();
        let entry = sessions.get_mut(&session_id)?;
        mutate(&mut entry.session);
        Some(entry.session.snapshot(entry.is_active()))
    }

    pub(crate) fn publish(&self, snapshot: SessionSnapshot) {
        self.hub.publish(snapshot);
    }

    pub(crate) fn send_signal(&self, signal: MonitorSignal) {
        let _ = self.signals.send(signal);
    }

    pub(crate) async fn notify_progress(&self, snapshot: &SessionSnapshot) {
        self.collaborators.notifications.show_progress(snapshot).await;
    }

    /// Persist the session's current state; failures are logged, not fatal.
    pub(crate) async fn persist_session(&self, session_id: Uuid) {
        let session = self.read_session(session_id, Clone::clone);
        if let Some(session) = session
            && let Err(err) = self.store.save(&session).await
        {
            warn!(%session_id, error = %err, "session persistence failed");
        }
    }

    /// Launch the pipeline for the session and record its handle.
    fn spawn_pipeline(self: &Arc<Self>, session_id: Uuid, parsed: ParsedSource) {
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shared.run_pipeline(session_id, parsed).await;
        });
        let mut sessions = self.table_write();
        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.pipeline = Some(handle);
        } else {
            handle.abort();
        }
    }

    async fn run_pipeline(self: Arc<Self>, session_id: Uuid, parsed: ParsedSource) {
        if let Err(err) = self.pipeline_inner(session_id, parsed).await {
            warn!(%session_id, error = %err, "download pipeline failed");
            self.fail_session(session_id, err.to_string()).await;
        }
    }

    async fn pipeline_inner(
        self: &Arc<Self>,
        session_id: Uuid,
        parsed: ParsedSource,
    ) -> DownloadResult<()> {
        let (magnet, metadata, info, peers) = match parsed {
            ParsedSource::Magnet(magnet) => {
                let payload = self.acquirer.acquire(&magnet).await?;
                let (metadata, info) =
                    decode_metainfo(payload.metadata, self.config.large_payload_threshold).await?;
                (Some(magnet), metadata, info, payload.peers)
            }
            ParsedSource::Metainfo { bytes, info } => (None, bytes, info, Vec::new()),
        };

        // The session may have been removed while metadata resolved.
        let Some(save_path) = self.read_session(session_id, |session| session.save_path.clone())
        else {
            return Ok(());
        };

        let mut trackers = info.trackers.clone();
        let mut web_seeds = info.web_seeds.clone();
        if let Some(magnet) = &magnet {
            for tracker in &magnet.trackers {
                if !trackers.contains(tracker) {
                    trackers.push(tracker.clone());
                }
            }
            for seed in &magnet.web_seeds {
                if !web_seeds.contains(seed) {
                    web_seeds.push(seed.clone());
                }
            }
        }

        let task = self
            .engine
            .create_task(TaskSpec {
                metadata,
                save_path,
                sequential: true,
                trackers,
                web_seeds,
            })
            .await
            .map_err(|source| DownloadError::TaskCreationFailure {
                source: source.into(),
            })?;

        if let Some(magnet) = &magnet
            && !magnet.selected_files.is_empty()
            && let Err(err) = task.apply_selected_files(&magnet.selected_files).await
        {
            warn!(%session_id, error = %err, "file selection not applied");
        }
        for peer in peers {
            if let Err(err) = task.add_peer(peer).await {
                debug!(%session_id, error = %err, "exchange peer not added");
            }
        }
        for node in info.dht_nodes.clone() {
            if let Err(err) = task.add_dht_node(node).await {
                debug!(%session_id, error = %err, "dht node not added");
            }
        }

        task.start()
            .await
            .map_err(|err| DownloadError::task_operation("start", err))?;

        let attached = {
            let mut sessions = self.table_write();
            match sessions.get_mut(&session_id) {
                Some(entry) if !entry.session.status.is_terminal() => {
                    // The caller may have paused while the task was starting;
                    // the pause wins and the task is stopped below.
                    let paused = entry.session.status == SessionStatus::Paused;
                    entry.task = Some(Arc::clone(&task));
                    if !paused {
                        entry.session.mark_downloading();
                    }
                    entry.session.total_bytes = info.total_length;
                    if entry.session.title.is_none() {
                        entry.session.title = Some(info.name.clone());
                    }
                    entry.monitor = Some(tokio::spawn(monitor::run(
                        Arc::clone(self),
                        session_id,
                        Arc::clone(&task),
                    )));
                    Some((entry.session.snapshot(true), paused))
                }
                _ => None,
            }
        };

        if let Some((snapshot, paused)) = attached {
            if paused {
                task.stop()
                    .await
                    .map_err(|err| DownloadError::task_operation("stop", err))?;
            }
            info!(%session_id, info_hash = %info.info_hash, "transfer started");
            self.publish(snapshot);
            self.persist_session(session_id).await;
        } else {
            // Session vanished mid-pipeline; release the orphaned task.
            let _ = task.stop().await;
            let _ = task.dispose().await;
        }
        Ok(())
    }

    /// Move the session to `Failed`, tear down its runtime, keep the record.
    pub(crate) async fn fail_session(&self, session_id: Uuid, message: String) {
        let torn_down = {
            let mut sessions = self.table_write();
            let Some(entry) = sessions.get_mut(&session_id) else {
                return;
            };
            if entry.session.status.is_terminal() {
                return;
            }
            entry.session.mark_failed(message);
            if let Some(handle) = entry.monitor.take() {
                handle.abort();
            }
            if let Some(handle) = entry.purge.take() {
                handle.abort();
            }
            (entry.task.take(), entry.session.snapshot(false))
        };
        let (task, snapshot) = torn_down;

        warn!(%session_id, error = ?snapshot.last_error, "session failed");
        self.publish(snapshot);
        self.hub.close(session_id);
        self.persist_session(session_id).await;
        if let Some(task) = task {
            if let Err(err) = task.stop().await {
                debug!(%session_id, error = %err, "stop on failed session");
            }
            if let Err(err) = task.dispose().await {
                warn!(%session_id, error = %err, "dispose on failed session");
            }
        }
        self.collaborators.notifications.cancel(session_id).await;
    }

    /// Completion side effects after the monitor publishes the terminal
    /// snapshot: dispose the task, fire collaborators, schedule the purge.
    async fn finalize_completion(self: &Arc<Self>, session_id: Uuid) {
        let taken = {
            let mut sessions = self.table_write();
            let Some(entry) = sessions.get_mut(&session_id) else {
                return;
            };
            entry.monitor.take();
            (entry.task.take(), entry.session.cover_url.clone())
        };
        let (task, cover_url) = taken;

        self.hub.close(session_id);
        if let Some(task) = task {
            if let Err(err) = task.stop().await {
                debug!(%session_id, error = %err, "stop on completed session");
            }
            if let Err(err) = task.dispose().await {
                warn!(%session_id, error = %err, "dispose on completed session");
            }
        }
        self.collaborators.notifications.cancel(session_id).await;
        self.collaborators.library.trigger().await;
        if let Some(url) = cover_url {
            self.collaborators.covers.fetch(session_id, &url).await;
        }

        let shared = Arc::clone(self);
        let grace = self.config.completed_purge_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            shared.purge_session(session_id).await;
        });
        let mut sessions = self.table_write();
        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.purge = Some(handle);
        }
    }

    /// Drop a completed session from the table and the store.
    async fn purge_session(&self, session_id: Uuid) {
        let removed = {
            let mut sessions = self.table_write();
            sessions.remove(&session_id).is_some()
        };
        if removed {
            debug!(%session_id, "purging completed session");
            if let Err(err) = self.store.delete(session_id).await {
                warn!(%session_id, error = %err, "purge of session record failed");
            }
        }
    }

    /// Apply the retry policy to a reported network error.
    async fn handle_network_error(self: &Arc<Self>, session_id: Uuid, cause: String) {
        let Some(decision) = self.read_session(session_id, |session| {
            self.retry.decide(session.status, session.retry_count)
        }) else {
            return;
        };
        match decision {
            RetryDecision::Skip => {
                debug!(%session_id, cause = %cause, "network error ignored in current state");
            }
            RetryDecision::Fail => {
                self.fail_session(
                    session_id,
                    format!(
                        "network failure after {} retries: {cause}",
                        self.config.retry.max_retries
                    ),
                )
                .await;
            }
            RetryDecision::Backoff { attempt, delay } => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(%session_id, attempt, delay_ms, cause = %cause, "retry scheduled");
                if let Some(snapshot) = self.update_session(session_id, |session| {
                    session.retry_count = attempt;
                    session.retry_cause = Some(cause.clone());
                    session.last_network_error_at = Some(Utc::now());
                }) {
                    self.publish(snapshot);
                }
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.recover(session_id).await;
                });
            }
        }
    }

    /// Re-run the full start pipeline for a session with no live task,
    /// reusing its stored source and save path.
    async fn relaunch(self: &Arc<Self>, session_id: Uuid) -> DownloadResult<()> {
        let (source, save_path, launching) = {
            let sessions = self.table_read();
            let entry = sessions
                .get(&session_id)
                .ok_or(DownloadError::SessionNotFound { session_id })?;
            (
                entry.session.source.clone(),
                entry.session.save_path.clone(),
                entry
                    .pipeline
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished()),
            )
        };
        if launching {
            // A start pipeline is already in flight; let it finish.
            return Ok(());
        }
        let parsed = parse_source(&source, self.config.large_payload_threshold).await?;
        ensure_directory(&save_path).await?;

        self.hub.open(session_id);
        let status = source.initial_status();
        if let Some(snapshot) = self.update_session(session_id, |session| {
            session.status = status;
            session.paused_at = None;
            session.reset_retry_state();
        }) {
            self.publish(snapshot);
        }
        self.spawn_pipeline(session_id, parsed);
        info!(%session_id, "session relaunched");
        Ok(())
    }

    /// Backoff elapsed: bounce the task to re-establish connections, or
    /// relaunch the whole pipeline when no live task exists.
    async fn recover(self: &Arc<Self>, session_id: Uuid) {
        let task = {
            let sessions = self.table_read();
            let Some(entry) = sessions.get(&session_id) else {
                return;
            };
            if entry.session.status != SessionStatus::Downloading {
                return;
            }
            entry.task.clone()
        };
        let Some(task) = task else {
            debug!(%session_id, "no live task after backoff; relaunching from source");
            if let Err(err) = self.relaunch(session_id).await {
                warn!(%session_id, error = %err, "relaunch after backoff failed");
                self.fail_session(session_id, err.to_string()).await;
            }
            return;
        };
        debug!(%session_id, "retry backoff elapsed; restarting task");
        if let Err(err) = task.stop().await {
            debug!(%session_id, error = %err, "stop during recovery");
        }
        if let Err(err) = task.start().await {
            warn!(%session_id, error = %err, "recovery restart failed");
            self.send_signal(MonitorSignal::NetworkError {
                session_id,
                cause: format!("restart failed: {err}"),
            });
        }
    }
}

async fn run_supervisor(shared: Arc<Shared>, mut signals: mpsc::UnboundedReceiver<MonitorSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            MonitorSignal::Completed { session_id } => {
                shared.finalize_completion(session_id).await;
            }
            MonitorSignal::NetworkError { session_id, cause } => {
                shared.handle_network_error(session_id, cause).await;
            }
            MonitorSignal::Fatal {
                session_id,
                message,
            } => {
                shared.fail_session(session_id, message).await;
            }
        }
    }
}

/// Validate a source up front so unusable input fails before any session
/// state is created.
async fn parse_source(source: &DownloadSource, threshold: usize) -> DownloadResult<ParsedSource> {
    match source {
        DownloadSource::Magnet { uri } => MagnetLink::parse(uri)
            .map(ParsedSource::Magnet)
            .map_err(DownloadError::invalid_source),
        DownloadSource::Metainfo { bytes } => {
            let (bytes, info) = decode_metainfo(bytes.clone(), threshold).await?;
            Ok(ParsedSource::Metainfo { bytes, info })
        }
    }
}

/// Decode torrent bytes, moving large payloads off the async runtime.
async fn decode_metainfo(
    bytes: Vec<u8>,
    threshold: usize,
) -> DownloadResult<(Vec<u8>, Box<Metainfo>)> {
    if bytes.len() >= threshold {
        tokio::task::spawn_blocking(
            move || -> Result<(Vec<u8>, Box<Metainfo>), audiotome_torrent::MetainfoError> {
                let info = Metainfo::decode(&bytes)?;
                Ok((bytes, Box::new(info)))
            },
        )
        .await
        .map_err(DownloadError::invalid_source)?
        .map_err(DownloadError::invalid_source)
    } else {
        let info = Metainfo::decode(&bytes).map_err(DownloadError::invalid_source)?;
        Ok((bytes, Box::new(info)))
    }
}

/// Create the save directory and verify it is writable.
async fn ensure_directory(path: &Path) -> DownloadResult<()> {
    match tokio::fs::create_dir_all(path).await {
        Ok(()) => {}
        Err(source) if source.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DownloadError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            });
        }
        Err(source) => {
            return Err(DownloadError::DirectoryCreationFailure {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    let probe = path.join(".audiotome-write-probe");
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            Ok(())
        }
        Err(source) if source.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(DownloadError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(DownloadError::DirectoryCreationFailure {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Public entry point for download session management.
pub struct DownloadOrchestrator {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl DownloadOrchestrator {
    /// Construct an orchestrator. Must be called within a Tokio runtime;
    /// the supervisor loop is spawned immediately.
    #[must_use]
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        store: Arc<dyn SessionStore>,
        config: DownloaderConfig,
        collaborators: Collaborators,
    ) -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();
        let retry = RetryController::new(config.retry.clone());
        let acquirer = MetadataAcquirer::new(Arc::clone(&engine), config.metadata_timeout);
        let shared = Arc::new(Shared {
            engine,
            store,
            hub: SnapshotHub::new(),
            config,
            retry,
            acquirer,
            collaborators,
            sessions: RwLock::new(HashMap::new()),
            signals,
        });
        let supervisor = tokio::spawn(run_supervisor(Arc::clone(&shared), receiver));
        Self { shared, supervisor }
    }

    /// Load persisted sessions into the table without starting transfers.
    ///
    /// Sessions whose save directory no longer exists are dropped from the
    /// store. Restored sessions keep their persisted status and progress but
    /// are inactive until resumed or restarted.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Store`] when the store cannot be read.
    pub async fn restore(&self) -> DownloadResult<usize> {
        let records = self.shared.store.list_all().await?;
        let mut restored = 0;
        for session in records {
            let session_id = session.id;
            if !tokio::fs::try_exists(&session.save_path).await.unwrap_or(false) {
                debug!(%session_id, "dropping restored session with missing directory");
                if let Err(err) = self.shared.store.delete(session_id).await {
                    warn!(%session_id, error = %err, "stale session record not deleted");
                }
                continue;
            }
            self.shared.hub.open(session_id);
            let mut sessions = self.shared.table_write();
            sessions
                .entry(session_id)
                .or_insert_with(|| SessionEntry::new(session));
            restored += 1;
        }
        info!(restored, "session restoration complete");
        Ok(restored)
    }

    /// Start a new download session; returns its identifier.
    ///
    /// The source is validated and the save directory prepared before the
    /// session exists; the pipeline (metadata acquisition, task creation,
    /// transfer start) then runs in the background.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidSource`] for unparseable input and
    /// [`DownloadError::PermissionDenied`] or
    /// [`DownloadError::DirectoryCreationFailure`] when the save directory
    /// cannot be prepared.
    pub async fn start(
        &self,
        source: DownloadSource,
        save_path: PathBuf,
        title: Option<String>,
        cover_url: Option<String>,
    ) -> DownloadResult<Uuid> {
        let parsed = parse_source(&source, self.shared.config.large_payload_threshold).await?;
        ensure_directory(&save_path).await?;

        let session = Session::new(source, save_path, title, cover_url);
        let session_id = session.id;
        info!(%session_id, kind = session.source.kind(), "session starting");

        self.shared.hub.open(session_id);
        let snapshot = session.snapshot(true);
        {
            let mut sessions = self.shared.table_write();
            sessions.insert(session_id, SessionEntry::new(session));
        }
        self.shared.publish(snapshot);
        self.shared.persist_session(session_id).await;
        self.shared.spawn_pipeline(session_id, parsed);
        Ok(session_id)
    }

    /// Pause an actively downloading session.
    ///
    /// A session whose start pipeline has not yet attached a task pauses
    /// immediately; the pipeline stops the task when it attaches.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::SessionNotFound`] for unknown identifiers,
    /// [`DownloadError::InvalidTransition`] when the session is not
    /// downloading, and [`DownloadError::TaskOperationFailed`] when the
    /// engine refuses.
    pub async fn pause(&self, session_id: Uuid) -> DownloadResult<()> {
        let task = {
            let sessions = self.shared.table_read();
            let entry = sessions
                .get(&session_id)
                .ok_or(DownloadError::SessionNotFound { session_id })?;
            if entry.session.status != SessionStatus::Downloading {
                return Err(DownloadError::InvalidTransition {
                    operation: "pause",
                    status: entry.session.status.label(),
                });
            }
            entry.task.clone()
        };
        if let Some(task) = task {
            task.stop()
                .await
                .map_err(|err| DownloadError::task_operation("stop", err))?;
        }
        if let Some(snapshot) = self.shared.update_session(session_id, Session::mark_paused) {
            self.shared.publish(snapshot);
        }
        self.shared.persist_session(session_id).await;
        info!(%session_id, "session paused");
        Ok(())
    }

    /// Resume a paused session.
    ///
    /// A session restored without a live task is relaunched through the full
    /// pipeline; its progress carries over via the engine's own resume data.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::SessionNotFound`] for unknown identifiers,
    /// [`DownloadError::InvalidTransition`] when the session is not paused,
    /// and [`DownloadError::TaskOperationFailed`] when the engine refuses.
    pub async fn resume(&self, session_id: Uuid) -> DownloadResult<()> {
        let task = {
            let sessions = self.shared.table_read();
            let entry = sessions
                .get(&session_id)
                .ok_or(DownloadError::SessionNotFound { session_id })?;
            if entry.session.status != SessionStatus::Paused {
                return Err(DownloadError::InvalidTransition {
                    operation: "resume",
                    status: entry.session.status.label(),
                });
            }
            entry.task.clone()
        };
        match task {
            Some(task) => {
                task.start()
                    .await
                    .map_err(|err| DownloadError::task_operation("start", err))?;
                if let Some(snapshot) =
                    self.shared.update_session(session_id, Session::mark_downloading)
                {
                    self.shared.publish(snapshot);
                }
                self.shared.persist_session(session_id).await;
                info!(%session_id, "session resumed");
                Ok(())
            }
            None => {
                // Clear the pause before relaunching, so a start pipeline
                // that is still in flight attaches into the downloading
                // state instead of honouring the stale pause.
                if let Some(snapshot) =
                    self.shared.update_session(session_id, Session::mark_downloading)
                {
                    self.shared.publish(snapshot);
                }
                self.shared.persist_session(session_id).await;
                self.shared.relaunch(session_id).await
            }
        }
    }

    /// Restart a session's transfer in place, keeping its identifier and
    /// progress. A restored session without a live task is relaunched.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::SessionNotFound`] for unknown identifiers
    /// and [`DownloadError::TaskOperationFailed`] when the engine refuses.
    pub async fn restart(&self, session_id: Uuid) -> DownloadResult<()> {
        let task = {
            let sessions = self.shared.table_read();
            let entry = sessions
                .get(&session_id)
                .ok_or(DownloadError::SessionNotFound { session_id })?;
            entry.task.clone()
        };
        match task {
            Some(task) => {
                task.stop()
                    .await
                    .map_err(|err| DownloadError::task_operation("stop", err))?;
                task.start()
                    .await
                    .map_err(|err| DownloadError::task_operation("start", err))?;
                if let Some(snapshot) = self.shared.update_session(session_id, |session| {
                    session.mark_downloading();
                    session.reset_retry_state();
                }) {
                    self.shared.publish(snapshot);
                }
                self.shared.persist_session(session_id).await;
                info!(%session_id, "session restarted");
                Ok(())
            }
            None => self.shared.relaunch(session_id).await,
        }
    }

    /// Remove the session and start a fresh one from the same source.
    /// Returns the new session's identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::SessionNotFound`] for unknown identifiers,
    /// plus any error [`Self::start`] can produce.
    pub async fn redownload(&self, session_id: Uuid) -> DownloadResult<Uuid> {
        let (source, save_path, title, cover_url) = self
            .shared
            .read_session(session_id, |session| {
                (
                    session.source.clone(),
                    session.save_path.clone(),
                    session.title.clone(),
                    session.cover_url.clone(),
                )
            })
            .ok_or(DownloadError::SessionNotFound { session_id })?;
        self.remove(session_id).await?;
        self.start(source, save_path, title, cover_url).await
    }

    /// Remove a session: abort its runtime, dispose its task, close its
    /// stream, and delete its record. Removing an unknown session is a
    /// no-op, so repeated removals are safe.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` reserves room for store-backed
    /// removal policies.
    pub async fn remove(&self, session_id: Uuid) -> DownloadResult<()> {
        let entry = {
            let mut sessions = self.shared.table_write();
            sessions.remove(&session_id)
        };
        let Some(mut entry) = entry else {
            return Ok(());
        };

        info!(%session_id, "removing session");
        if let Some(handle) = entry.monitor.take() {
            handle.abort();
        }
        if let Some(handle) = entry.purge.take() {
            handle.abort();
        }
        // The pipeline keeps running detached; when it finds the session
        // gone it stops and disposes any task it has created.
        drop(entry.pipeline.take());
        entry.session.status = SessionStatus::Removed;
        self.shared.publish(entry.session.snapshot(false));
        self.shared.hub.close(session_id);
        if let Some(task) = entry.task.take() {
            if let Err(err) = task.stop().await {
                debug!(%session_id, error = %err, "stop on removed session");
            }
            if let Err(err) = task.dispose().await {
                warn!(%session_id, error = %err, "dispose on removed session");
            }
        }
        if let Err(err) = self.shared.store.delete(session_id).await {
            warn!(%session_id, error = %err, "session record not deleted");
        }
        self.shared.collaborators.notifications.cancel(session_id).await;
        Ok(())
    }

    /// Snapshots of every known session, oldest first.
    ///
    /// Inactive sessions whose save directory has vanished are purged from
    /// the table and the store instead of being returned.
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let inactive: Vec<(Uuid, PathBuf)> = {
            let sessions = self.shared.table_read();
            sessions
                .values()
                .filter(|entry| !entry.is_active())
                .map(|entry| (entry.session.id, entry.session.save_path.clone()))
                .collect()
        };
        for (session_id, path) in inactive {
            if tokio::fs::try_exists(&path).await.unwrap_or(true) {
                continue;
            }
            debug!(%session_id, "purging session with missing directory");
            {
                let mut sessions = self.shared.table_write();
                sessions.remove(&session_id);
            }
            self.shared.hub.close(session_id);
            if let Err(err) = self.shared.store.delete(session_id).await {
                warn!(%session_id, error = %err, "stale session record not deleted");
            }
        }

        let sessions = self.shared.table_read();
        let mut snapshots: Vec<SessionSnapshot> = sessions
            .values()
            .map(|entry| entry.session.snapshot(entry.is_active()))
            .collect();
        snapshots.sort_by_key(|snapshot| {
            let started = sessions
                .get(&snapshot.id)
                .map(|entry| entry.session.started_at);
            (started, snapshot.id)
        });
        snapshots
    }

    /// Subscribe to a session's progress stream.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::SessionNotFound`] when no live stream exists
    /// for the identifier.
    pub fn progress_stream(&self, session_id: Uuid) -> DownloadResult<SnapshotStream> {
        self.shared
            .hub
            .subscribe(session_id)
            .ok_or(DownloadError::SessionNotFound { session_id })
    }

    /// Stop all runtime activity, persisting final state for restoration.
    ///
    /// Session records stay in the store; a later [`Self::restore`] brings
    /// the sessions back.
    pub async fn shutdown(&self) {
        info!("download orchestrator shutting down");
        self.supervisor.abort();
        let tasks: Vec<(Uuid, Arc<dyn TorrentTask>)> = {
            let mut sessions = self.shared.table_write();
            sessions
                .values_mut()
                .filter_map(|entry| {
                    entry.abort_background();
                    entry.task.take().map(|task| (entry.session.id, task))
                })
                .collect()
        };
        for (session_id, task) in tasks {
            self.shared.persist_session(session_id).await;
            if let Err(err) = task.stop().await {
                debug!(%session_id, error = %err, "stop during shutdown");
            }
            if let Err(err) = task.dispose().await {
                warn!(%session_id, error = %err, "dispose during shutdown");
            }
        }
        self.shared.hub.close_all();
    }
}
