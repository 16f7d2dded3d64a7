//! Tunable thresholds for the download orchestrator.
//!
//! Every heuristic the monitor and retry machinery rely on lives here so
//! deployments can tune them without code changes. The defaults reflect
//! audiobook-sized payloads on consumer connections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bytes above which torrent payload decoding moves off the async runtime.
const DEFAULT_LARGE_PAYLOAD_THRESHOLD: usize = 2 * 1024 * 1024;

/// Top-level configuration for [`crate::DownloadOrchestrator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Progress monitor thresholds.
    pub monitor: MonitorConfig,
    /// Retry and backoff policy.
    pub retry: RetryConfig,
    /// How long a magnet metadata exchange may run before it is abandoned.
    pub metadata_timeout: Duration,
    /// Minimum interval between periodic session persistence writes.
    pub persist_interval: Duration,
    /// Grace period before a completed session is dropped from the table.
    pub completed_purge_grace: Duration,
    /// Torrent payloads at or above this size decode on a blocking thread.
    pub large_payload_threshold: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            retry: RetryConfig::default(),
            metadata_timeout: Duration::from_secs(180),
            persist_interval: Duration::from_secs(5),
            completed_purge_grace: Duration::from_secs(30),
            large_payload_threshold: DEFAULT_LARGE_PAYLOAD_THRESHOLD,
        }
    }
}

/// Thresholds for the per-session progress monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling cadence for task snapshots.
    pub tick_interval: Duration,
    /// Percentage above which a stalled transfer is treated as a hang.
    pub hang_progress_pct: f64,
    /// How long a near-complete transfer may stall before forced completion.
    pub hang_grace: Duration,
    /// Hard ceiling on time spent above the hang threshold.
    pub hang_deadline: Duration,
    /// Zero-speed, zero-peer duration that counts as network loss.
    pub network_loss_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            hang_progress_pct: 99.0,
            hang_grace: Duration::from_secs(20),
            hang_deadline: Duration::from_secs(180),
            network_loss_window: Duration::from_secs(120),
        }
    }
}

/// Retry ceiling and exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Network errors tolerated before a session fails terminally.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub backoff_base: Duration,
    /// Upper bound on the random jitter added to each backoff delay.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            max_jitter: Duration::from_secs(1),
        }
    }
}
