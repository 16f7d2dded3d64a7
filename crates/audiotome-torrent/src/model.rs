//! DTOs crossing the engine boundary.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 20-byte SHA-1 digest identifying a torrent's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Wrap a raw 20-byte digest.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parse a 40-character hexadecimal digest.
    #[must_use]
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() != 40 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = [0_u8; 20];
        for (index, chunk) in value.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[index] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Where a peer address was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    /// Discovered during the metadata handshake for a magnet link.
    MetadataExchange,
    /// Announced by a tracker.
    Tracker,
    /// Found via the distributed hash table.
    Dht,
}

/// Peer endpoint handed to a task, typically `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Socket address in `host:port` form.
    pub address: String,
    /// Provenance of the address.
    pub source: PeerSource,
}

/// DHT bootstrap hint carried in a metainfo `nodes` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtNode {
    /// Node hostname or IP address.
    pub host: String,
    /// Node UDP port.
    pub port: u16,
}

/// Request to create a task from resolved metadata.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Bencoded metainfo payload.
    pub metadata: Vec<u8>,
    /// Directory the payload is written into.
    pub save_path: PathBuf,
    /// Whether pieces are fetched in file order rather than rarest-first.
    pub sequential: bool,
    /// Additional tracker URLs for the task.
    pub trackers: Vec<String>,
    /// Web seed URLs for the task.
    pub web_seeds: Vec<String>,
}

/// Read-only view of a running task's transfer state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskSnapshot {
    /// Completion fraction in the range 0..=1.
    pub progress: f64,
    /// Bytes received so far.
    pub downloaded_bytes: u64,
    /// Total payload size in bytes.
    pub total_bytes: u64,
    /// Current download rate in bytes per second.
    pub download_speed_bps: u64,
    /// Current upload rate in bytes per second.
    pub upload_speed_bps: u64,
    /// Connected peers holding the complete file set.
    pub seeder_count: u64,
    /// All connected peers, seeders included.
    pub peer_count: u64,
    /// Display name from the task's metainfo, once known.
    pub name: Option<String>,
}

impl TaskSnapshot {
    /// Completion percentage in the range 0–100.
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        (self.progress * 100.0).clamp(0.0, 100.0)
    }

    /// Connected peers still downloading.
    #[must_use]
    pub const fn leecher_count(&self) -> u64 {
        self.peer_count.saturating_sub(self.seeder_count)
    }
}

/// Lifecycle notifications a task delivers to its single subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task began transferring.
    Started,
    /// Every selected byte has been received and verified.
    AllComplete,
}

/// Result of a completed metadata exchange.
#[derive(Debug, Clone)]
pub struct MetadataPayload {
    /// Raw bencoded metainfo resolved from the swarm.
    pub metadata: Vec<u8>,
    /// Peers contacted during the exchange, reusable by the main task.
    pub peers: Vec<PeerAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_round_trips_hex() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let hash = InfoHash::from_hex(hex).expect("valid digest");
        assert_eq!(hash.to_string(), hex);
    }

    #[test]
    fn info_hash_rejects_bad_input() {
        assert!(InfoHash::from_hex("deadbeef").is_none(), "too short");
        assert!(
            InfoHash::from_hex("zz23456789abcdef0123456789abcdef01234567").is_none(),
            "non-hex characters"
        );
    }

    #[test]
    fn snapshot_percent_is_clamped() {
        let snapshot = TaskSnapshot {
            progress: 1.02,
            ..TaskSnapshot::default()
        };
        assert!((snapshot.percent_complete() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn leecher_count_never_underflows() {
        let snapshot = TaskSnapshot {
            seeder_count: 5,
            peer_count: 3,
            ..TaskSnapshot::default()
        };
        assert_eq!(snapshot.leecher_count(), 0);
    }
}
