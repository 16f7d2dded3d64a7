//! Magnet URI parsing.
//!
//! Extracts the pieces of a magnet link the orchestrator cares about: the
//! 40-hex info hash (required), display name, tracker and web-seed lists,
//! and the BEP-0053 `so=` file-selection indices.

use std::string::FromUtf8Error;

use thiserror::Error;

use crate::model::InfoHash;

/// Errors produced while parsing a magnet URI.
#[derive(Debug, Error)]
pub enum MagnetError {
    /// The value does not carry the `magnet:?` scheme.
    #[error("not a magnet URI")]
    Scheme {
        /// Offending value, truncated for logging.
        value: String,
    },
    /// No `xt=urn:btih:` parameter was present.
    #[error("magnet URI missing info hash")]
    MissingInfoHash,
    /// The info hash was not a 40-character hexadecimal digest.
    #[error("magnet URI carries invalid info hash")]
    InvalidInfoHash {
        /// Offending digest value.
        value: String,
    },
    /// The `so=` file selection could not be parsed.
    #[error("magnet URI carries invalid file selection")]
    InvalidSelection {
        /// Offending selection value.
        value: String,
    },
    /// A parameter value failed percent-decoding.
    #[error("magnet URI parameter failed to decode")]
    Decode {
        /// Parameter key that failed.
        field: String,
        /// Underlying decoding error.
        source: FromUtf8Error,
    },
}

/// Parsed representation of a magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Torrent info hash.
    pub info_hash: InfoHash,
    /// Display name (`dn=`), when present.
    pub display_name: Option<String>,
    /// Tracker URLs (`tr=`), in order of appearance.
    pub trackers: Vec<String>,
    /// Web seed URLs (`ws=`), in order of appearance.
    pub web_seeds: Vec<String>,
    /// BEP-0053 selected file indices (`so=`), expanded from ranges.
    pub selected_files: Vec<u32>,
}

impl MagnetLink {
    /// Parse a magnet URI.
    ///
    /// # Errors
    ///
    /// Returns a [`MagnetError`] when the scheme is wrong, the info hash is
    /// missing or malformed, or a parameter fails to decode.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| MagnetError::Scheme {
                value: uri.chars().take(32).collect(),
            })?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut web_seeds = Vec::new();
        let mut selected_files = Vec::new();

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let Some((key, raw_value)) = pair.split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(raw_value).map_err(|source| MagnetError::Decode {
                field: key.to_owned(),
                source,
            })?;

            match key {
                "xt" => {
                    if info_hash.is_none() {
                        info_hash = Some(parse_exact_topic(&value)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "ws" => web_seeds.push(value.into_owned()),
                "so" => selected_files = parse_selection(&value)?,
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            display_name,
            trackers,
            web_seeds,
            selected_files,
        })
    }
}

fn parse_exact_topic(value: &str) -> Result<InfoHash, MagnetError> {
    let digest = value
        .strip_prefix("urn:btih:")
        .ok_or(MagnetError::MissingInfoHash)?;
    InfoHash::from_hex(digest).ok_or_else(|| MagnetError::InvalidInfoHash {
        value: digest.to_owned(),
    })
}

/// Upper bound on expanded `so=` indices; ranges are attacker-supplied.
const MAX_SELECTED_FILES: usize = 10_000;

fn parse_selection(value: &str) -> Result<Vec<u32>, MagnetError> {
    let invalid = || MagnetError::InvalidSelection {
        value: value.chars().take(64).collect(),
    };

    let mut indices = Vec::new();
    for item in value.split(',').filter(|item| !item.is_empty()) {
        if let Some((start, end)) = item.split_once('-') {
            let start: u32 = start.parse().map_err(|_| invalid())?;
            let end: u32 = end.parse().map_err(|_| invalid())?;
            if end < start {
                return Err(invalid());
            }
            let span = usize::try_from(end - start)
                .map_err(|_| invalid())?
                .saturating_add(1);
            if indices.len().saturating_add(span) > MAX_SELECTED_FILES {
                return Err(invalid());
            }
            indices.extend(start..=end);
        } else {
            if indices.len() >= MAX_SELECTED_FILES {
                return Err(invalid());
            }
            indices.push(item.parse().map_err(|_| invalid())?);
        }
    }
    Ok(indices)
}
