//! Magnet metadata acquisition.
//!
//! Resolving a magnet link costs a peer-discovery round trip, so resolved
//! metadata is cached by info hash for the life of the process; redownloads
//! and restarts of the same magnet skip the exchange entirely. The exchange
//! handle is closed on every exit path, including caller cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use audiotome_torrent::{InfoHash, MagnetLink, MetadataExchange, MetadataPayload, TorrentEngine};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DownloadError, DownloadResult};

/// Resolves magnet links to raw metainfo bytes, with caching and a deadline.
pub struct MetadataAcquirer {
    engine: Arc<dyn TorrentEngine>,
    cache: Mutex<HashMap<InfoHash, Vec<u8>>>,
    timeout: Duration,
}

/// Closes the exchange when dropped, covering cancellation and timeout.
struct ExchangeGuard {
    inner: Box<dyn MetadataExchange>,
}

impl ExchangeGuard {
    async fn wait(&mut self) -> anyhow::Result<MetadataPayload> {
        self.inner.wait().await
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl MetadataAcquirer {
    /// Construct an acquirer bound to the engine with the given deadline.
    #[must_use]
    pub fn new(engine: Arc<dyn TorrentEngine>, timeout: Duration) -> Self {
        Self {
            engine,
            cache: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Resolve the magnet link to metadata and the peers contacted.
    ///
    /// A cache hit returns immediately with an empty peer list.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::MetadataTimeout`] when the exchange exceeds
    /// the deadline, or [`DownloadError::TaskOperationFailed`] when the
    /// engine rejects or aborts the exchange.
    pub async fn acquire(&self, magnet: &MagnetLink) -> DownloadResult<MetadataPayload> {
        if let Some(metadata) = self.cache.lock().await.get(&magnet.info_hash).cloned() {
            debug!(info_hash = %magnet.info_hash, "metadata cache hit");
            return Ok(MetadataPayload {
                metadata,
                peers: Vec::new(),
            });
        }

        let exchange = self
            .engine
            .open_metadata_exchange(magnet)
            .await
            .map_err(|err| DownloadError::task_operation("open_metadata_exchange", err))?;
        let mut guard = ExchangeGuard { inner: exchange };

        match tokio::time::timeout(self.timeout, guard.wait()).await {
            Ok(Ok(payload)) => {
                self.cache
                    .lock()
                    .await
                    .insert(magnet.info_hash, payload.metadata.clone());
                debug!(
                    info_hash = %magnet.info_hash,
                    bytes = payload.metadata.len(),
                    peers = payload.peers.len(),
                    "metadata resolved"
                );
                Ok(payload)
            }
            Ok(Err(err)) => Err(DownloadError::task_operation("metadata_exchange", err)),
            Err(_) => Err(DownloadError::MetadataTimeout {
                timeout: self.timeout,
            }),
        }
    }
}
