//! Deterministic fakes for the engine boundary.
//!
//! `ScriptedTask` replays a queue of snapshots (repeating the last one once
//! the queue drains), `ScriptedEngine` hands out scripted tasks and metadata
//! exchanges in order, and both record every call so tests can assert on
//! lifecycle interactions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use audiotome_torrent::{
    DhtNode, MagnetLink, MetadataExchange, MetadataPayload, PeerAddress, TaskError, TaskEvent,
    TaskResult, TaskSnapshot, TaskSpec, TorrentEngine, TorrentTask,
};
use tokio::sync::{Notify, broadcast};

/// Task fake replaying a scripted snapshot sequence.
pub struct ScriptedTask {
    snapshots: Mutex<VecDeque<TaskResult<TaskSnapshot>>>,
    last: Mutex<TaskSnapshot>,
    starts: AtomicU32,
    stops: AtomicU32,
    disposes: AtomicU32,
    selected_files: Mutex<Vec<Vec<u32>>>,
    peers: Mutex<Vec<PeerAddress>>,
    dht_nodes: Mutex<Vec<DhtNode>>,
    events: broadcast::Sender<TaskEvent>,
    gated: AtomicBool,
    gate: Notify,
}

impl ScriptedTask {
    /// A task whose snapshot reports zero progress until scripted otherwise.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            snapshots: Mutex::new(VecDeque::new()),
            last: Mutex::new(TaskSnapshot::default()),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            disposes: AtomicU32::new(0),
            selected_files: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            dht_nodes: Mutex::new(Vec::new()),
            events,
            gated: AtomicBool::new(false),
            gate: Notify::new(),
        })
    }

    /// Queue a snapshot for the next `snapshot()` call.
    pub fn push_snapshot(&self, snapshot: TaskSnapshot) {
        self.snapshots.lock().expect("script").push_back(Ok(snapshot));
    }

    /// Queue a snapshot read failure.
    pub fn push_error(&self, error: TaskError) {
        self.snapshots.lock().expect("script").push_back(Err(error));
    }

    /// Convenience: queue a snapshot from a completion fraction, rates, and
    /// peer counts against a fixed 1 MiB payload.
    pub fn push_progress(&self, progress: f64, speed_bps: u64, seeders: u64, peers: u64) {
        let total = 1_048_576_u64;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let downloaded = (progress.clamp(0.0, 1.0) * total as f64) as u64;
        self.push_snapshot(TaskSnapshot {
            progress,
            downloaded_bytes: downloaded,
            total_bytes: total,
            download_speed_bps: speed_bps,
            upload_speed_bps: 0,
            seeder_count: seeders,
            peer_count: peers,
            name: Some("scripted".to_owned()),
        });
    }

    /// Block `start()` calls until [`Self::release_starts`] is invoked, so a
    /// test can act while a start pipeline is still in flight.
    pub fn hold_starts(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Release a held `start()` call. A permit is stored when no call is
    /// waiting yet.
    pub fn release_starts(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    /// Emit a lifecycle event to subscribers.
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    /// Number of `start()` calls observed.
    #[must_use]
    pub fn start_calls(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop()` calls observed.
    #[must_use]
    pub fn stop_calls(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of `dispose()` calls observed.
    #[must_use]
    pub fn dispose_calls(&self) -> u32 {
        self.disposes.load(Ordering::SeqCst)
    }

    /// File selections applied to the task, in call order.
    #[must_use]
    pub fn applied_selections(&self) -> Vec<Vec<u32>> {
        self.selected_files.lock().expect("selections").clone()
    }

    /// Peers handed to the task, in call order.
    #[must_use]
    pub fn added_peers(&self) -> Vec<PeerAddress> {
        self.peers.lock().expect("peers").clone()
    }

    /// DHT nodes handed to the task, in call order.
    #[must_use]
    pub fn added_dht_nodes(&self) -> Vec<DhtNode> {
        self.dht_nodes.lock().expect("nodes").clone()
    }
}

#[async_trait]
impl TorrentTask for ScriptedTask {
    async fn start(&self) -> anyhow::Result<()> {
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.disposes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot(&self) -> TaskResult<TaskSnapshot> {
        let next = self.snapshots.lock().expect("script").pop_front();
        match next {
            Some(Ok(snapshot)) => {
                *self.last.lock().expect("last snapshot") = snapshot.clone();
                Ok(snapshot)
            }
            Some(Err(error)) => Err(error),
            None => Ok(self.last.lock().expect("last snapshot").clone()),
        }
    }

    async fn apply_selected_files(&self, indices: &[u32]) -> anyhow::Result<()> {
        self.selected_files
            .lock()
            .expect("selections")
            .push(indices.to_vec());
        Ok(())
    }

    async fn add_peer(&self, peer: PeerAddress) -> anyhow::Result<()> {
        self.peers.lock().expect("peers").push(peer);
        Ok(())
    }

    async fn add_dht_node(&self, node: DhtNode) -> anyhow::Result<()> {
        self.dht_nodes.lock().expect("nodes").push(node);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }
}

/// Behaviour of a scripted metadata exchange.
pub enum ExchangeScript {
    /// Resolve immediately with the payload.
    Resolve(MetadataPayload),
    /// Fail immediately with the message.
    Fail(String),
    /// Never resolve; forces the caller's timeout path.
    Never,
}

/// Metadata exchange fake with a shared closed flag.
pub struct ScriptedExchange {
    script: Option<ExchangeScript>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl MetadataExchange for ScriptedExchange {
    async fn wait(&mut self) -> anyhow::Result<MetadataPayload> {
        match self.script.take() {
            Some(ExchangeScript::Resolve(payload)) => Ok(payload),
            Some(ExchangeScript::Fail(message)) => bail!(message),
            Some(ExchangeScript::Never) | None => {
                std::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for ScriptedExchange {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Engine fake handing out scripted tasks and exchanges in queue order.
pub struct ScriptedEngine {
    tasks: Mutex<VecDeque<Arc<ScriptedTask>>>,
    created: Mutex<Vec<Arc<ScriptedTask>>>,
    specs: Mutex<Vec<TaskSpec>>,
    exchanges: Mutex<VecDeque<ExchangeScript>>,
    exchange_closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
    create_failure: Mutex<Option<String>>,
}

impl ScriptedEngine {
    /// An engine with no scripted behaviour; tasks are created on demand.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            exchanges: Mutex::new(VecDeque::new()),
            exchange_closed_flags: Mutex::new(Vec::new()),
            create_failure: Mutex::new(None),
        })
    }

    /// Queue a task to be returned by the next `create_task` call.
    pub fn push_task(&self, task: Arc<ScriptedTask>) {
        self.tasks.lock().expect("tasks").push_back(task);
    }

    /// Queue a metadata-exchange behaviour.
    pub fn push_exchange(&self, script: ExchangeScript) {
        self.exchanges.lock().expect("exchanges").push_back(script);
    }

    /// Make the next `create_task` call fail with the message.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        *self.create_failure.lock().expect("failure") = Some(message.into());
    }

    /// Tasks created so far, in creation order.
    #[must_use]
    pub fn created_tasks(&self) -> Vec<Arc<ScriptedTask>> {
        self.created.lock().expect("created").clone()
    }

    /// Specs passed to `create_task`, in call order.
    #[must_use]
    pub fn created_specs(&self) -> Vec<TaskSpec> {
        self.specs.lock().expect("specs").clone()
    }

    /// Whether every opened exchange has been closed.
    #[must_use]
    pub fn all_exchanges_closed(&self) -> bool {
        self.exchange_closed_flags
            .lock()
            .expect("flags")
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl TorrentEngine for ScriptedEngine {
    async fn create_task(&self, spec: TaskSpec) -> anyhow::Result<Arc<dyn TorrentTask>> {
        if let Some(message) = self.create_failure.lock().expect("failure").take() {
            return Err(anyhow!(message));
        }
        self.specs.lock().expect("specs").push(spec);
        let task = self
            .tasks
            .lock()
            .expect("tasks")
            .pop_front()
            .unwrap_or_else(ScriptedTask::new);
        self.created.lock().expect("created").push(Arc::clone(&task));
        Ok(task)
    }

    async fn open_metadata_exchange(
        &self,
        _magnet: &MagnetLink,
    ) -> anyhow::Result<Box<dyn MetadataExchange>> {
        let script = self
            .exchanges
            .lock()
            .expect("exchanges")
            .pop_front()
            .unwrap_or(ExchangeScript::Never);
        let closed = Arc::new(AtomicBool::new(false));
        self.exchange_closed_flags
            .lock()
            .expect("flags")
            .push(Arc::clone(&closed));
        Ok(Box::new(ScriptedExchange {
            script: Some(script),
            closed,
        }))
    }
}
