#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Engine-agnostic torrent interfaces and source parsing.
//!
//! The download orchestrator treats the BitTorrent engine as a black box;
//! this crate defines the traits it consumes ([`TorrentEngine`],
//! [`TorrentTask`], [`MetadataExchange`]) together with the DTOs crossing
//! that boundary, plus magnet-URI parsing and bencoded metainfo decoding
//! used to validate download sources before a task exists.

pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod model;
pub mod service;

pub use error::{TaskError, TaskResult};
pub use magnet::{MagnetError, MagnetLink};
pub use metainfo::{Metainfo, MetainfoError, MetainfoFile};
pub use model::{
    DhtNode, InfoHash, MetadataPayload, PeerAddress, PeerSource, TaskEvent, TaskSnapshot, TaskSpec,
};
pub use service::{MetadataExchange, TorrentEngine, TorrentTask};
