//! Bencoded metainfo decoding.
//!
//! Decodes raw `.torrent` bytes into the structured view the orchestrator
//! needs (file list, lengths, tracker and DHT hints) and computes the
//! info hash by re-encoding the `info` dictionary. Bencode dictionaries are
//! key-sorted by definition, so re-encoding reproduces the original bytes.

use std::collections::HashMap;

use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::model::{DhtNode, InfoHash};

/// Errors produced while decoding metainfo bytes.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The payload is not valid bencode.
    #[error("metainfo failed to decode")]
    Decode {
        /// Underlying bencode error.
        #[source]
        source: serde_bencode::Error,
    },
    /// The `info` dictionary could not be re-encoded for hashing.
    #[error("metainfo info dictionary failed to encode")]
    Encode {
        /// Underlying bencode error.
        #[source]
        source: serde_bencode::Error,
    },
    /// The top-level value is not a dictionary.
    #[error("metainfo root is not a dictionary")]
    NotADictionary,
    /// The required `info` dictionary is absent.
    #[error("metainfo missing info dictionary")]
    MissingInfoDict,
    /// A structural invariant does not hold.
    #[error("metainfo structure is invalid")]
    InvalidStructure {
        /// Static reason for the failure.
        reason: &'static str,
    },
}

/// Individual file described by a metainfo payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetainfoFile {
    /// Path relative to the torrent root, `/`-joined.
    pub path: String,
    /// File length in bytes.
    pub length: u64,
}

/// Structured view of a decoded metainfo payload.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 digest of the bencoded `info` dictionary.
    pub info_hash: InfoHash,
    /// Torrent name; directory name for multi-file payloads.
    pub name: String,
    /// Total payload size in bytes.
    pub total_length: u64,
    /// Files in payload order.
    pub files: Vec<MetainfoFile>,
    /// Tracker URLs from `announce` / `announce-list`.
    pub trackers: Vec<String>,
    /// Web seed URLs from `url-list`.
    pub web_seeds: Vec<String>,
    /// DHT bootstrap hints from `nodes`.
    pub dht_nodes: Vec<DhtNode>,
}

#[derive(serde::Deserialize)]
struct RawInfo {
    name: String,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: serde_bytes::ByteBuf,
}

#[derive(serde::Deserialize)]
struct RawFile {
    length: i64,
    path: Vec<String>,
}

impl Metainfo {
    /// Decode raw torrent bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`MetainfoError`] when the payload is not bencode, lacks an
    /// `info` dictionary, or violates structural invariants (empty or
    /// misaligned piece hashes, negative lengths, missing file list).
    pub fn decode(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let root: Value =
            serde_bencode::from_bytes(bytes).map_err(|source| MetainfoError::Decode { source })?;
        let Value::Dict(root) = root else {
            return Err(MetainfoError::NotADictionary);
        };

        let info_value = root
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingInfoDict)?;
        let info_bytes = serde_bencode::to_bytes(info_value)
            .map_err(|source| MetainfoError::Encode { source })?;
        let info_hash = InfoHash::new(Sha1::digest(&info_bytes).into());

        let info: RawInfo = serde_bencode::from_bytes(&info_bytes)
            .map_err(|source| MetainfoError::Decode { source })?;
        validate_pieces(&info)?;
        let (files, total_length) = collect_files(&info)?;

        Ok(Self {
            info_hash,
            name: info.name,
            total_length,
            files,
            trackers: collect_trackers(&root),
            web_seeds: collect_web_seeds(&root),
            dht_nodes: collect_dht_nodes(&root),
        })
    }
}

fn validate_pieces(info: &RawInfo) -> Result<(), MetainfoError> {
    if info.piece_length <= 0 {
        return Err(MetainfoError::InvalidStructure {
            reason: "piece length must be positive",
        });
    }
    if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
        return Err(MetainfoError::InvalidStructure {
            reason: "piece hashes must be a non-empty multiple of 20 bytes",
        });
    }
    Ok(())
}

fn collect_files(info: &RawInfo) -> Result<(Vec<MetainfoFile>, u64), MetainfoError> {
    if let Some(raw_files) = &info.files {
        if raw_files.is_empty() {
            return Err(MetainfoError::InvalidStructure {
                reason: "multi-file metainfo carries an empty file list",
            });
        }
        let mut files = Vec::with_capacity(raw_files.len());
        let mut total = 0_u64;
        for raw in raw_files {
            let length = to_length(raw.length)?;
            total = total
                .checked_add(length)
                .ok_or(MetainfoError::InvalidStructure {
                    reason: "file lengths overflow the total payload size",
                })?;
            files.push(MetainfoFile {
                path: raw.path.join("/"),
                length,
            });
        }
        return Ok((files, total));
    }

    let length = to_length(info.length.ok_or(MetainfoError::InvalidStructure {
        reason: "metainfo carries neither a length nor a file list",
    })?)?;
    let files = vec![MetainfoFile {
        path: info.name.clone(),
        length,
    }];
    Ok((files, length))
}

fn to_length(value: i64) -> Result<u64, MetainfoError> {
    u64::try_from(value).map_err(|_| MetainfoError::InvalidStructure {
        reason: "file length must be non-negative",
    })
}

fn collect_trackers(root: &HashMap<Vec<u8>, Value>) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(Value::Bytes(announce)) = root.get(b"announce".as_slice())
        && let Ok(url) = String::from_utf8(announce.clone())
    {
        trackers.push(url);
    }
    if let Some(Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
        for tier in tiers {
            let Value::List(entries) = tier else {
                continue;
            };
            for entry in entries {
                if let Value::Bytes(url) = entry
                    && let Ok(url) = String::from_utf8(url.clone())
                    && !trackers.contains(&url)
                {
                    trackers.push(url);
                }
            }
        }
    }
    trackers
}

fn collect_web_seeds(root: &HashMap<Vec<u8>, Value>) -> Vec<String> {
    match root.get(b"url-list".as_slice()) {
        Some(Value::Bytes(single)) => String::from_utf8(single.clone())
            .ok()
            .map(|url| vec![url])
            .unwrap_or_default(),
        Some(Value::List(entries)) => entries
            .iter()
            .filter_map(|entry| match entry {
                Value::Bytes(url) => String::from_utf8(url.clone()).ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn collect_dht_nodes(root: &HashMap<Vec<u8>, Value>) -> Vec<DhtNode> {
    let Some(Value::List(entries)) = root.get(b"nodes".as_slice()) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let Value::List(pair) = entry else {
                return None;
            };
            let [Value::Bytes(host), Value::Int(port)] = pair.as_slice() else {
                return None;
            };
            let host = String::from_utf8(host.clone()).ok()?;
            let port = u16::try_from(*port).ok()?;
            Some(DhtNode { host, port })
        })
        .collect()
}
