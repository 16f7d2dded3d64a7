//! Engine, task, and metadata-exchange traits implemented by adapters.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TaskResult;
use crate::magnet::MagnetLink;
use crate::model::{DhtNode, MetadataPayload, PeerAddress, TaskEvent, TaskSnapshot, TaskSpec};

/// Primary engine trait implemented by adapters.
///
/// The orchestrator only ever creates tasks and opens metadata exchanges;
/// everything else goes through the returned handles.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Create a task for resolved metadata. The task starts stopped.
    async fn create_task(&self, spec: TaskSpec) -> anyhow::Result<Arc<dyn TorrentTask>>;

    /// Open a bounded peer-discovery exchange resolving a magnet link to
    /// raw metainfo bytes.
    async fn open_metadata_exchange(
        &self,
        magnet: &MagnetLink,
    ) -> anyhow::Result<Box<dyn MetadataExchange>>;
}

/// Handle to a single transfer inside the engine.
#[async_trait]
pub trait TorrentTask: Send + Sync {
    /// Begin (or continue) transferring.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop transferring; the task remains resumable.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Release all engine resources. The handle is unusable afterwards;
    /// disposing an already-disposed task is a no-op.
    async fn dispose(&self) -> anyhow::Result<()>;

    /// Read the current transfer state.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::TaskError`] classified as network-related or
    /// fatal, which callers use to choose between retry and failure.
    fn snapshot(&self) -> TaskResult<TaskSnapshot>;

    /// Restrict the download to the given file indices.
    async fn apply_selected_files(&self, indices: &[u32]) -> anyhow::Result<()>;

    /// Hand the task a known peer address.
    async fn add_peer(&self, peer: PeerAddress) -> anyhow::Result<()>;

    /// Hand the task a DHT bootstrap node.
    async fn add_dht_node(&self, node: DhtNode) -> anyhow::Result<()>;

    /// Subscribe to task lifecycle events.
    fn events(&self) -> broadcast::Receiver<TaskEvent>;
}

/// Bounded metadata handshake for a magnet link.
///
/// Implementations must release their resources when [`close`] is called
/// and also on drop, so a cancelled caller never leaks an exchange.
///
/// [`close`]: MetadataExchange::close
#[async_trait]
pub trait MetadataExchange: Send {
    /// Wait for the exchange to produce metadata and the peers contacted.
    async fn wait(&mut self) -> anyhow::Result<MetadataPayload>;

    /// Release the exchange's resources. Idempotent.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeerSource;

    struct NullTask {
        events: broadcast::Sender<TaskEvent>,
    }

    #[async_trait]
    impl TorrentTask for NullTask {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn dispose(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn snapshot(&self) -> TaskResult<TaskSnapshot> {
            Ok(TaskSnapshot::default())
        }

        async fn apply_selected_files(&self, _indices: &[u32]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn add_peer(&self, _peer: PeerAddress) -> anyhow::Result<()> {
            Ok(())
        }

        async fn add_dht_node(&self, _node: DhtNode) -> anyhow::Result<()> {
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<TaskEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test]
    async fn task_trait_is_object_safe_and_usable() {
        let (events, _) = broadcast::channel(4);
        let task: Arc<dyn TorrentTask> = Arc::new(NullTask { events });
        task.start().await.expect("start");
        task.add_peer(PeerAddress {
            address: "198.51.100.7:6881".to_owned(),
            source: PeerSource::MetadataExchange,
        })
        .await
        .expect("add peer");
        let snapshot = task.snapshot().expect("snapshot");
        assert!(snapshot.progress.abs() < f64::EPSILON);
    }
}
