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

//! Download orchestration core for Audiotome.
//!
//! Turns a magnet link or raw torrent bytes into a durable, resumable,
//! monitored download session on top of an external torrent engine. The
//! [`DownloadOrchestrator`] owns the session table and drives state
//! transitions; a per-session [`monitor`] loop samples progress and detects
//! hangs and network loss; the [`retry`] policy governs backoff and the
//! retry ceiling; sessions persist through a [`store::SessionStore`] so they
//! survive process restarts.
//!
//! Layout: `model.rs` (session record), `config.rs` (tunable thresholds),
//! `store.rs` (persistence), `acquire.rs` (magnet metadata resolution),
//! `monitor.rs` / `retry.rs` (anomaly detection and recovery), and
//! `orchestrator.rs` (the public API).

pub mod acquire;
pub mod config;
pub mod error;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod store;

pub use acquire::MetadataAcquirer;
pub use config::{DownloaderConfig, MonitorConfig, RetryConfig};
pub use error::{DownloadError, DownloadResult};
pub use model::{DownloadSource, Session};
pub use orchestrator::{
    Collaborators, CoverFetch, DownloadOrchestrator, LibraryRescan, NotificationSink,
};
pub use retry::{RetryController, RetryDecision};
pub use store::{JsonSessionStore, SessionStore, StoreError, StoreResult};
