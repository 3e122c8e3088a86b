//! polsync store: in-RAM versioned datastore.
//!
//! An etcd-like backend: one global revision counter, bounded change history
//! for point-in-time reads and resumed watches, store-driven TTL expiry and
//! per-watcher fan-out. Every mutation happens inside one critical section,
//! so a dropped or cancelled call either committed fully or not at all.

#![forbid(unsafe_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use polsync_core::options::ListOptions;
use polsync_core::{
    Backend, Capabilities, Error, Kind, Resource, ResourceKey, ResourceList, Result, Revision, WatchEvent, WatchStream,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

mod state;

use state::State;

/// Store tuning, read from the environment with defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Number of changes retained for historical reads and watch replay.
    pub history_limit: usize,
    /// Per-watcher delivery buffer.
    pub watch_buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { history_limit: 10_000, watch_buffer: 256 }
    }
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            history_limit: env_usize("POLSYNC_HISTORY_LIMIT").unwrap_or(d.history_limit),
            watch_buffer: env_usize("POLSYNC_WATCH_BUFFER").unwrap_or(d.watch_buffer),
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| s.parse::<usize>().ok())
}

struct Inner {
    state: Mutex<State>,
    cfg: MemoryConfig,
}

/// In-memory backend. Clones share the same store.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Store tuned from `POLSYNC_HISTORY_LIMIT` / `POLSYNC_WATCH_BUFFER`.
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::from_env())
    }

    pub fn with_config(cfg: MemoryConfig) -> Self {
        Self { inner: Arc::new(Inner { state: Mutex::new(State::new(cfg.history_limit)), cfg }) }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        Revision::from_counter(self.inner.state.lock().revision())
    }

    /// Number of watch streams still attached.
    pub fn watcher_count(&self) -> usize {
        self.inner.state.lock().subscriber_count()
    }

    /// Remove every key of every kind (administrative prefix delete). Each
    /// removed key produces its own `Deleted` event.
    pub fn clean(&self) -> usize {
        let n = self.inner.state.lock().clean(None);
        info!(removed = n, "store: cleaned");
        n
    }

    /// Remove every key of one kind.
    pub fn clean_kind(&self, kind: &Kind) -> usize {
        let n = self.inner.state.lock().clean(Some(kind));
        info!(kind = %kind, removed = n, "store: cleaned kind");
        n
    }

    /// Simulate loss of the datastore connection: every open watch receives
    /// one `Error` event and closes.
    pub fn disconnect_watchers(&self) -> usize {
        let n = self.inner.state.lock().disconnect("connection to datastore lost");
        info!(watchers = n, "store: watchers disconnected");
        n
    }

    fn write<T>(&self, op: &'static str, f: impl FnOnce(&mut State, Instant) -> Result<T>) -> Result<T> {
        let mut st = self.inner.state.lock();
        let now = Instant::now();
        let expired = st.reap(now);
        if expired > 0 {
            counter!("store_expired_total", expired as u64);
        }
        let res = f(&mut st, now);
        if res.is_ok() {
            counter!("store_writes_total", 1u64, "op" => op);
        }
        gauge!("store_live_keys", st.live_len() as f64);
        res
    }

    /// Expire `key` once `ttl` has elapsed. Expiry is also applied lazily on
    /// every access, so the timer only has to guarantee the `Deleted` event
    /// reaches watchers without further traffic.
    fn schedule_expiry(&self, key: ResourceKey, ttl: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                let n = inner.state.lock().reap(Instant::now());
                if n > 0 {
                    counter!("store_expired_total", n as u64);
                }
                debug!(key = %key, expired = n, "store: ttl timer fired");
            }
        });
    }

    fn deadline(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|t| now + t)
    }
}

fn parse_revision(rev: &Revision, field: &str) -> Result<u64> {
    rev.as_counter().ok_or_else(|| Error::invalid_input(field, rev.as_str(), "revision is not valid for this datastore"))
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { key_watch: true, historical_reads: true, ttl: true }
    }

    async fn create(&self, resource: Resource, ttl: Option<Duration>) -> Result<Resource> {
        let key = resource.key();
        let out = self.write("create", |st, now| st.create(resource, Self::deadline(now, ttl)))?;
        if let Some(ttl) = ttl {
            self.schedule_expiry(key, ttl);
        }
        Ok(out)
    }

    async fn update(&self, resource: Resource, ttl: Option<Duration>) -> Result<Resource> {
        let key = resource.key();
        let out = self.write("update", |st, now| st.update(resource, Self::deadline(now, ttl)))?;
        if let Some(ttl) = ttl {
            self.schedule_expiry(key, ttl);
        }
        Ok(out)
    }

    async fn get(&self, key: &ResourceKey, revision: Option<&Revision>) -> Result<Resource> {
        let at = revision.map(|r| parse_revision(r, "GetOptions.ResourceVersion")).transpose()?;
        let mut st = self.inner.state.lock();
        st.reap(Instant::now());
        st.get(key, at)
    }

    async fn delete(&self, key: &ResourceKey, revision: Option<&Revision>) -> Result<Resource> {
        self.write("delete", |st, _| st.delete(key, revision))
    }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> Result<ResourceList> {
        let at =
            opts.resource_version.as_ref().map(|r| parse_revision(r, "ListOptions.ResourceVersion")).transpose()?;
        let mut st = self.inner.state.lock();
        st.reap(Instant::now());
        let (items, rev) = st.list(kind, opts, at)?;
        Ok(ResourceList { items, revision: Revision::from_counter(rev) })
    }

    async fn watch(&self, kind: &Kind, opts: &ListOptions) -> Result<WatchStream> {
        let after =
            opts.resource_version.as_ref().map(|r| parse_revision(r, "ListOptions.ResourceVersion")).transpose()?;
        let (utx, mut urx) = mpsc::unbounded_channel::<WatchEvent>();
        {
            let mut st = self.inner.state.lock();
            st.reap(Instant::now());
            st.subscribe(kind, opts, after, utx)?;
        }
        let (tx, stream) = WatchStream::channel(self.inner.cfg.watch_buffer);
        let kind = kind.clone();
        debug!(kind = %kind, after = ?after, "store: watch opened");
        tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    biased;
                    _ = tx.cancelled() => break,
                    ev = urx.recv() => ev,
                };
                let Some(ev) = ev else { break };
                let fatal = ev.is_error();
                counter!("store_watch_events_total", 1u64);
                if !tx.send(ev).await || fatal {
                    break;
                }
            }
            debug!(kind = %kind, "store: watch closed");
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polsync_core::WatchEventType;

    fn res(name: &str) -> Resource {
        Resource::new(Kind::PROFILE, name, serde_json::json!({}))
    }

    #[tokio::test]
    async fn watch_stops_when_consumer_stops() {
        let be = MemoryBackend::new();
        let mut w = be.watch(&Kind::PROFILE, &ListOptions::default()).await.unwrap();
        assert_eq!(be.watcher_count(), 1);
        w.stop();
        be.create(res("a"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(be.watcher_count(), 0);
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_surfaces_one_error_then_closes() {
        let be = MemoryBackend::new();
        let mut w = be.watch(&Kind::PROFILE, &ListOptions::default()).await.unwrap();
        assert_eq!(be.disconnect_watchers(), 1);
        let ev = w.next().await.unwrap();
        assert_eq!(ev.event_type(), WatchEventType::Error);
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn non_counter_revisions_are_invalid_input() {
        let be = MemoryBackend::new();
        let err = be.get(&res("a").key(), Some(&Revision::from("abc"))).await.unwrap_err();
        assert_eq!(err.field(), Some("GetOptions.ResourceVersion"));
    }

    #[test]
    fn config_defaults_and_env_overrides() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.history_limit, 10_000);
        assert_eq!(cfg.watch_buffer, 256);

        std::env::set_var("POLSYNC_HISTORY_LIMIT", "5000");
        std::env::set_var("POLSYNC_WATCH_BUFFER", "not-a-number");
        let cfg = MemoryConfig::from_env();
        std::env::remove_var("POLSYNC_HISTORY_LIMIT");
        std::env::remove_var("POLSYNC_WATCH_BUFFER");
        assert_eq!(cfg, MemoryConfig { history_limit: 5000, watch_buffer: 256 });
    }
}
