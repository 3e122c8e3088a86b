//! polsync syncer: turns per-kind watch streams into one ordered,
//! deduplicated stream of low-level KV updates.
//!
//! A pipeline generation lists every registered kind, accumulates the
//! processed results until all kinds have reported their snapshot, emits them
//! as one initial batch and then relays live changes one by one.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use polsync_core::model::{KeyFamily, KvPair};
use polsync_core::{Error, Kind, ResourceKey};
use tokio::sync::mpsc;

mod pipeline;
pub mod processor;
pub mod processors;

pub use pipeline::{Syncer, SyncerBuilder, SyncerHandle, SyncerStats};
pub use processor::{ResourceUpdate, SimpleProcessor, UpdateProcessor};
pub use processors::{bgp_peer_processor, ProfileProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Resyncing,
    InSync,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Resyncing => "resyncing",
            Self::InSync => "in-sync",
            Self::Error => "error",
        })
    }
}

/// Downstream consumer. Called from the coordinator task only, one call at a
/// time, in delivery order.
pub trait SyncerCallbacks: Send + Sync + 'static {
    fn on_status_updated(&self, status: SyncStatus);
    /// Every live pair after resync, sorted by key.
    fn on_initial_batch(&self, pairs: Vec<KvPair>);
    fn on_update(&self, pair: KvPair);
}

/// One callback invocation, as delivered by [`ChannelCallbacks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncerOutput {
    Status(SyncStatus),
    InitialBatch(Vec<KvPair>),
    Update(KvPair),
}

/// Callbacks that forward every delivery into an unbounded channel.
pub struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<SyncerOutput>,
}

impl ChannelCallbacks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncerOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SyncerCallbacks for ChannelCallbacks {
    fn on_status_updated(&self, status: SyncStatus) {
        let _ = self.tx.send(SyncerOutput::Status(status));
    }

    fn on_initial_batch(&self, pairs: Vec<KvPair>) {
        let _ = self.tx.send(SyncerOutput::InitialBatch(pairs));
    }

    fn on_update(&self, pair: KvPair) {
        let _ = self.tx.send(SyncerOutput::Update(pair));
    }
}

/// Pipeline tuning, read from the environment with defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncerConfig {
    /// Capacity of the channel between the per-kind feeders and the coordinator.
    pub queue_cap: usize,
    /// Bound on each initial list call.
    pub op_timeout: Duration,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self { queue_cap: 1024, op_timeout: Duration::from_secs(30) }
    }
}

impl SyncerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let queue_cap = std::env::var("POLSYNC_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(d.queue_cap);
        let op_timeout = std::env::var("POLSYNC_OP_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.op_timeout);
        Self { queue_cap: queue_cap.max(1), op_timeout }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    #[error("processor for kind {processor} cannot be registered against a client for kind {client}")]
    KindMismatch { client: Kind, processor: Kind },
    #[error("kind {0} is already registered")]
    DuplicateKind(Kind),
    #[error("key family {family:?} is produced by both {owner} and {kind}")]
    FamilyConflict { family: KeyFamily, owner: Kind, kind: Kind },
    #[error("no update processors registered")]
    NoProcessors,
    #[error("a syncer generation is already running")]
    AlreadyRunning,
    #[error("stream for {kind} failed: {source}")]
    Stream {
        kind: Kind,
        #[source]
        source: Error,
    },
    #[error("processing {key} failed: {source}")]
    Processor {
        key: ResourceKey,
        #[source]
        source: Error,
    },
    #[error("coordinator task aborted: {0}")]
    Aborted(String),
}

impl SyncerError {
    /// Configuration errors are reported before any stream is opened.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::KindMismatch { .. } | Self::DuplicateKind(_) | Self::FamilyConflict { .. } | Self::NoProcessors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_renders_lowercase() {
        assert_eq!(SyncStatus::InSync.to_string(), "in-sync");
        assert_eq!(SyncStatus::default(), SyncStatus::Idle);
    }

    #[test]
    fn config_defaults() {
        let cfg = SyncerConfig::default();
        assert_eq!(cfg.queue_cap, 1024);
        assert_eq!(cfg.op_timeout, Duration::from_secs(30));
    }

    #[test]
    fn config_errors_are_classified() {
        assert!(SyncerError::DuplicateKind(Kind::PROFILE).is_config());
        assert!(!SyncerError::AlreadyRunning.is_config());
    }
}
