use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use polsync_client::ResourceClient;
use polsync_core::model::{KeyFamily, KvPair, LowLevelKey, LowLevelValue};
use polsync_core::options::ListOptions;
use polsync_core::{Error, Kind, Resource, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::processor::{ResourceUpdate, UpdateProcessor};
use crate::{SyncStatus, SyncerCallbacks, SyncerConfig, SyncerError};

type SharedProcessor = Arc<Mutex<Box<dyn UpdateProcessor>>>;

#[derive(Clone)]
struct Registration {
    kind: Kind,
    client: ResourceClient,
    processor: SharedProcessor,
}

/// Collects (client, processor) pairs and validates them before anything runs.
#[derive(Default)]
pub struct SyncerBuilder {
    cfg: SyncerConfig,
    regs: Vec<Registration>,
    families: FxHashMap<KeyFamily, Kind>,
}

impl SyncerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, cfg: SyncerConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn register(mut self, client: ResourceClient, processor: impl UpdateProcessor) -> Result<Self, SyncerError> {
        let kind = processor.kind().clone();
        if client.kind() != &kind {
            return Err(SyncerError::KindMismatch { client: client.kind().clone(), processor: kind });
        }
        if self.regs.iter().any(|r| r.kind == kind) {
            return Err(SyncerError::DuplicateKind(kind));
        }
        for family in processor.families() {
            if let Some(owner) = self.families.get(family) {
                return Err(SyncerError::FamilyConflict { family: *family, owner: owner.clone(), kind });
            }
        }
        for family in processor.families() {
            self.families.insert(*family, kind.clone());
        }
        debug!(kind = %kind, families = ?processor.families(), "syncer: processor registered");
        self.regs.push(Registration { kind, client, processor: Arc::new(Mutex::new(Box::new(processor))) });
        Ok(self)
    }

    pub fn build(self) -> Result<Syncer, SyncerError> {
        if self.regs.is_empty() {
            return Err(SyncerError::NoProcessors);
        }
        Ok(Syncer {
            cfg: self.cfg,
            regs: Arc::from(self.regs),
            running: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
            stats: Arc::new(ArcSwap::from_pointee(SyncerStats::default())),
        })
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncerStats {
    pub status: SyncStatus,
    pub generation: u64,
    /// Live low-level keys downstream currently holds.
    pub live_keys: usize,
    pub relayed: u64,
    pub suppressed: u64,
}

/// A built pipeline. Each `start` runs one generation.
pub struct Syncer {
    cfg: SyncerConfig,
    regs: Arc<[Registration]>,
    running: Arc<AtomicBool>,
    generation: AtomicU64,
    stats: Arc<ArcSwap<SyncerStats>>,
}

impl Syncer {
    pub fn builder() -> SyncerBuilder {
        SyncerBuilder::new()
    }

    pub fn kinds(&self) -> Vec<Kind> {
        self.regs.iter().map(|r| r.kind.clone()).collect()
    }

    pub fn stats(&self) -> Arc<SyncerStats> {
        self.stats.load_full()
    }

    pub fn status(&self) -> SyncStatus {
        self.stats.load().status
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a generation. Fails if the previous one has not ended yet.
    pub fn start(&self, callbacks: Arc<dyn SyncerCallbacks>) -> Result<SyncerHandle, SyncerError> {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(SyncerError::AlreadyRunning);
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        for reg in self.regs.iter() {
            reg.processor.lock().on_syncer_starting();
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Msg>(self.cfg.queue_cap);
        let mut feeders = JoinSet::new();
        for reg in self.regs.iter() {
            feeders.spawn(feed(reg.client.clone(), self.cfg, tx.clone(), cancel.child_token()));
        }
        drop(tx);

        let processors = self.regs.iter().map(|r| (r.kind.clone(), Arc::clone(&r.processor))).collect();
        let coord = Coordinator {
            generation,
            processors,
            callbacks,
            pending: self.regs.len(),
            snapshotted: FxHashSet::default(),
            accum: BTreeMap::new(),
            live: FxHashMap::default(),
            stats: Arc::clone(&self.stats),
            relayed: 0,
            suppressed: 0,
            started: Instant::now(),
        };
        info!(generation, kinds = self.regs.len(), "syncer: starting");
        let running = Arc::clone(&self.running);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let res = coord.run(rx, token.clone()).await;
            token.cancel();
            while feeders.join_next().await.is_some() {}
            running.store(false, Ordering::Release);
            res
        });
        Ok(SyncerHandle { cancel, join })
    }
}

/// Control handle for one running generation.
pub struct SyncerHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<(), SyncerError>>,
}

impl SyncerHandle {
    /// Ask the generation to stop; deliveries already dispatched complete.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the generation to end: `Ok` after `stop`, the fatal error otherwise.
    pub async fn wait(self) -> Result<(), SyncerError> {
        self.join.await.map_err(|e| SyncerError::Aborted(e.to_string()))?
    }

    pub async fn stop_and_wait(self) -> Result<(), SyncerError> {
        self.stop();
        self.wait().await
    }
}

enum Msg {
    Snapshot { kind: Kind, items: Vec<Resource> },
    Event { kind: Kind, event: WatchEvent },
    Failed { kind: Kind, error: Error },
}

async fn forward(tx: &mpsc::Sender<Msg>, cancel: &CancellationToken, msg: Msg) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(msg) => res.is_ok(),
    }
}

/// List one kind, report the snapshot, then watch from the list revision.
async fn feed(client: ResourceClient, cfg: SyncerConfig, tx: mpsc::Sender<Msg>, cancel: CancellationToken) {
    let kind = client.kind().clone();
    let listed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        res = tokio::time::timeout(cfg.op_timeout, client.list(ListOptions::default())) => res,
    };
    let list = match listed {
        Ok(Ok(list)) => list,
        Ok(Err(error)) => {
            forward(&tx, &cancel, Msg::Failed { kind, error }).await;
            return;
        }
        Err(_) => {
            let error = Error::Cancelled { reason: format!("list {kind}: deadline of {:?} exceeded", cfg.op_timeout) };
            forward(&tx, &cancel, Msg::Failed { kind, error }).await;
            return;
        }
    };
    debug!(kind = %kind, count = list.items.len(), rev = %list.revision, "syncer: snapshot listed");
    let from = list.revision.clone();
    if !forward(&tx, &cancel, Msg::Snapshot { kind: kind.clone(), items: list.items }).await {
        return;
    }

    let mut stream = match client.watch(ListOptions::from_revision(from)).await {
        Ok(s) => s,
        Err(error) => {
            forward(&tx, &cancel, Msg::Failed { kind, error }).await;
            return;
        }
    };
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let msg = match next {
            Some(event) => Msg::Event { kind: kind.clone(), event },
            None => Msg::Failed { kind: kind.clone(), error: Error::StreamError("watch stream closed".to_string()) },
        };
        let last = matches!(msg, Msg::Failed { .. });
        if !forward(&tx, &cancel, msg).await || last {
            break;
        }
    }
    stream.stop();
    debug!(kind = %kind, "syncer: feeder stopped");
}

struct Coordinator {
    generation: u64,
    processors: FxHashMap<Kind, SharedProcessor>,
    callbacks: Arc<dyn SyncerCallbacks>,
    /// Kinds whose snapshot has not arrived yet.
    pending: usize,
    snapshotted: FxHashSet<Kind>,
    /// Resync accumulation; only live pairs are kept.
    accum: BTreeMap<LowLevelKey, KvPair>,
    /// Values downstream currently holds.
    live: FxHashMap<LowLevelKey, LowLevelValue>,
    stats: Arc<ArcSwap<SyncerStats>>,
    relayed: u64,
    suppressed: u64,
    started: Instant,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>, cancel: CancellationToken) -> Result<(), SyncerError> {
        self.set_status(SyncStatus::Resyncing);
        let res = loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break Ok(()) };
            if let Err(e) = self.handle(msg) {
                break Err(e);
            }
        };
        match &res {
            Ok(()) => {
                info!(generation = self.generation, "syncer: stopped");
                self.set_status(SyncStatus::Idle);
            }
            Err(e) => {
                error!(generation = self.generation, error = %e, "syncer: generation failed");
                counter!("syncer_generation_failures_total", 1u64);
                self.set_status(SyncStatus::Error);
            }
        }
        res
    }

    fn handle(&mut self, msg: Msg) -> Result<(), SyncerError> {
        match msg {
            Msg::Snapshot { kind, items } => {
                for r in items {
                    let pairs = self.process(&kind, &ResourceUpdate::upsert(r))?;
                    self.accumulate(pairs);
                }
                if self.snapshotted.insert(kind.clone()) {
                    self.pending = self.pending.saturating_sub(1);
                    debug!(kind = %kind, pending = self.pending, "syncer: kind snapshotted");
                }
                if self.pending == 0 {
                    self.finish_resync();
                }
                Ok(())
            }
            Msg::Event { kind, event } => {
                let update = match event {
                    WatchEvent::Added(object) | WatchEvent::Modified { object, .. } => ResourceUpdate::upsert(object),
                    WatchEvent::Deleted { previous, revision } => {
                        ResourceUpdate::deletion(previous.key(), Some(revision))
                    }
                    WatchEvent::Error(source) => return Err(SyncerError::Stream { kind, source }),
                };
                let pairs = self.process(&kind, &update)?;
                if self.pending > 0 {
                    self.accumulate(pairs);
                } else {
                    for kv in pairs {
                        self.relay(kv);
                    }
                    self.publish_stats(SyncStatus::InSync);
                }
                Ok(())
            }
            Msg::Failed { kind, error } => {
                warn!(kind = %kind, error = %error, "syncer: feeder failed");
                Err(SyncerError::Stream { kind, source: error })
            }
        }
    }

    fn process(&self, kind: &Kind, update: &ResourceUpdate) -> Result<polsync_core::model::KvUpdates, SyncerError> {
        let Some(processor) = self.processors.get(kind) else {
            return Err(SyncerError::Processor {
                key: update.key.clone(),
                source: Error::invalid_input("Kind", kind.as_str(), "no processor registered for kind"),
            });
        };
        processor.lock().process(update).map_err(|source| SyncerError::Processor { key: update.key.clone(), source })
    }

    fn accumulate(&mut self, pairs: impl IntoIterator<Item = KvPair>) {
        for kv in pairs {
            if kv.is_deletion() {
                self.accum.remove(&kv.key);
            } else {
                self.accum.insert(kv.key.clone(), kv);
            }
        }
    }

    fn finish_resync(&mut self) {
        let batch: Vec<KvPair> = std::mem::take(&mut self.accum).into_values().collect();
        self.live = batch.iter().filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v))).collect();
        let elapsed = self.started.elapsed();
        histogram!("syncer_resync_ms", elapsed.as_secs_f64() * 1000.0);
        info!(generation = self.generation, keys = batch.len(), took_ms = %elapsed.as_millis(), "syncer: resync complete");
        self.callbacks.on_initial_batch(batch);
        self.set_status(SyncStatus::InSync);
    }

    /// Relay one pair unless downstream already reflects it.
    fn relay(&mut self, kv: KvPair) {
        let changed = match &kv.value {
            Some(v) => {
                if self.live.get(&kv.key) == Some(v) {
                    false
                } else {
                    self.live.insert(kv.key.clone(), v.clone());
                    true
                }
            }
            None => self.live.remove(&kv.key).is_some(),
        };
        if changed {
            self.relayed += 1;
            counter!("syncer_updates_relayed_total", 1u64);
            self.callbacks.on_update(kv);
        } else {
            self.suppressed += 1;
            counter!("syncer_updates_suppressed_total", 1u64);
            debug!(key = %kv.key, "syncer: unchanged update suppressed");
        }
    }

    fn set_status(&mut self, status: SyncStatus) {
        self.publish_stats(status);
        gauge!("syncer_status", status as u8 as f64);
        self.callbacks.on_status_updated(status);
    }

    fn publish_stats(&self, status: SyncStatus) {
        self.stats.store(Arc::new(SyncerStats {
            status,
            generation: self.generation,
            live_keys: self.live.len(),
            relayed: self.relayed,
            suppressed: self.suppressed,
        }));
    }
}
