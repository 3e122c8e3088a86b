//! Synchronous MVCC state behind the memory backend's lock.

use std::collections::VecDeque;

use chrono::Utc;
use polsync_core::options::ListOptions;
use polsync_core::{Error, Kind, Resource, ResourceKey, Result, Revision, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub(crate) struct Entry {
    pub resource: Resource,
    pub expires_at: Option<Instant>,
}

/// One committed change; `event` carries the key and both states.
#[derive(Clone)]
pub(crate) struct Change {
    pub revision: u64,
    pub event: WatchEvent,
}

pub(crate) struct Subscriber {
    pub kind: Kind,
    pub filter: ListOptions,
    pub tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Subscriber {
    fn wants(&self, key: &ResourceKey) -> bool {
        key.kind == self.kind && self.filter.matches(key.namespace.as_deref(), &key.name)
    }
}

pub(crate) struct State {
    revision: u64,
    live: FxHashMap<ResourceKey, Entry>,
    /// Every change with revision > `floor`, oldest first.
    history: VecDeque<Change>,
    floor: u64,
    history_limit: usize,
    subscribers: Vec<Subscriber>,
}

impl State {
    pub fn new(history_limit: usize) -> Self {
        Self {
            revision: 0,
            live: FxHashMap::default(),
            history: VecDeque::new(),
            floor: 0,
            history_limit: history_limit.max(1),
            subscribers: Vec::new(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn create(&mut self, mut res: Resource, expires_at: Option<Instant>) -> Result<Resource> {
        let key = res.key();
        if self.live.contains_key(&key) {
            return Err(Error::AlreadyExists { key });
        }
        let rev = self.bump();
        res.metadata.resource_version = Some(Revision::from_counter(rev));
        res.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        res.metadata.creation_timestamp = Some(Utc::now());
        self.live.insert(key, Entry { resource: res.clone(), expires_at });
        self.commit(rev, WatchEvent::Added(res.clone()));
        Ok(res)
    }

    pub fn update(&mut self, mut res: Resource, expires_at: Option<Instant>) -> Result<Resource> {
        let key = res.key();
        let Some(entry) = self.live.get(&key) else {
            return Err(Error::not_found(key, "key not found"));
        };
        if entry.resource.revision() != res.revision() {
            return Err(Error::Conflict { key });
        }
        let previous = entry.resource.clone();
        let rev = self.bump();
        res.metadata.resource_version = Some(Revision::from_counter(rev));
        res.metadata.uid = previous.metadata.uid.clone();
        res.metadata.creation_timestamp = previous.metadata.creation_timestamp;
        self.live.insert(key, Entry { resource: res.clone(), expires_at });
        self.commit(rev, WatchEvent::Modified { previous: Some(previous), object: res.clone() });
        Ok(res)
    }

    pub fn delete(&mut self, key: &ResourceKey, expected: Option<&Revision>) -> Result<Resource> {
        let Some(entry) = self.live.get(key) else {
            return Err(Error::not_found(key.clone(), "key not found"));
        };
        if let Some(expected) = expected {
            if entry.resource.revision() != Some(expected) {
                return Err(Error::Conflict { key: key.clone() });
            }
        }
        let rev = self.bump();
        self.remove(key, rev).ok_or_else(|| Error::not_found(key.clone(), "key not found"))
    }

    /// Remove every live key of `kind` (all kinds when `None`) at a single
    /// revision, one `Deleted` event per key.
    pub fn clean(&mut self, kind: Option<&Kind>) -> usize {
        let mut keys: Vec<ResourceKey> =
            self.live.keys().filter(|k| kind.map_or(true, |kind| &k.kind == kind)).cloned().collect();
        if keys.is_empty() {
            return 0;
        }
        keys.sort();
        let rev = self.bump();
        for key in &keys {
            self.remove(key, rev);
        }
        keys.len()
    }

    /// Delete every key whose TTL has elapsed. Returns the number expired.
    pub fn reap(&mut self, now: Instant) -> usize {
        let mut expired: Vec<ResourceKey> = self
            .live
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        expired.sort();
        for key in &expired {
            let rev = self.bump();
            self.remove(key, rev);
            debug!(key = %key, rev, "store: ttl expired");
        }
        expired.len()
    }

    pub fn get(&self, key: &ResourceKey, at: Option<u64>) -> Result<Resource> {
        let found = match at {
            None => self.live.get(key).map(|e| e.resource.clone()),
            Some(rev) => {
                self.check_revision(rev, "GetOptions.ResourceVersion")?;
                if rev < self.floor {
                    return Err(Error::not_found(key.clone(), format!("required revision {rev} has been compacted")));
                }
                self.state_at(key, rev)
            }
        };
        found.ok_or_else(|| Error::not_found(key.clone(), "key not found"))
    }

    /// Live resources of `kind` at `at` (current when `None`), sorted by key.
    /// Returns the revision the listing reflects.
    pub fn list(&self, kind: &Kind, filter: &ListOptions, at: Option<u64>) -> Result<(Vec<Resource>, u64)> {
        let at = match at {
            Some(rev) => {
                self.check_revision(rev, "ListOptions.ResourceVersion")?;
                if rev < self.floor {
                    warn!(kind = %kind, rev, floor = self.floor, "store: list revision compacted; serving current state");
                    None
                } else {
                    Some(rev)
                }
            }
            None => None,
        };
        let wants = |k: &ResourceKey| &k.kind == kind && filter.matches(k.namespace.as_deref(), &k.name);
        let mut items: Vec<Resource> = match at {
            None => self.live.iter().filter(|(k, _)| wants(*k)).map(|(_, e)| e.resource.clone()).collect(),
            Some(rev) => {
                let mut keys: FxHashSet<ResourceKey> = self.live.keys().filter(|k| wants(*k)).cloned().collect();
                keys.extend(self.history.iter().filter_map(|c| c.event.key()).filter(|k| wants(k)));
                keys.iter().filter_map(|k| self.state_at(k, rev)).collect()
            }
        };
        items.sort_by_key(|r| r.key());
        Ok((items, at.unwrap_or(self.revision)))
    }

    /// Register a watcher and queue its initial events under the same lock,
    /// so no change can fall between the initial events and live delivery.
    pub fn subscribe(
        &mut self,
        kind: &Kind,
        filter: &ListOptions,
        after: Option<u64>,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<()> {
        self.subscribers.retain(|s| !s.tx.is_closed());
        let sub = Subscriber { kind: kind.clone(), filter: filter.clone(), tx };
        if let Some(rev) = after {
            self.check_revision(rev, "ListOptions.ResourceVersion")?;
            if rev < self.floor {
                // Changes between `rev` and the floor are gone, deletions
                // included; the consumer has to start over from a snapshot.
                warn!(kind = %kind, rev, floor = self.floor, "store: watch revision compacted");
                let reason = format!("required revision {rev} has been compacted");
                let _ = sub.tx.send(WatchEvent::Error(Error::StreamError(reason)));
                return Ok(());
            }
        }
        let initial: Vec<WatchEvent> = match after {
            Some(rev) => self
                .history
                .iter()
                .filter(|c| c.revision > rev && c.event.key().is_some_and(|k| sub.wants(&k)))
                .map(|c| c.event.clone())
                .collect(),
            None => {
                let mut snap: Vec<&Resource> =
                    self.live.iter().filter(|(k, _)| sub.wants(k)).map(|(_, e)| &e.resource).collect();
                snap.sort_by_key(|r| r.key());
                snap.into_iter().cloned().map(WatchEvent::Added).collect()
            }
        };
        for ev in initial {
            if sub.tx.send(ev).is_err() {
                return Ok(());
            }
        }
        self.subscribers.push(sub);
        Ok(())
    }

    /// Watchers still attached to a consumer.
    pub fn subscriber_count(&mut self) -> usize {
        self.subscribers.retain(|s| !s.tx.is_closed());
        self.subscribers.len()
    }

    /// Fail every watcher with a stream error and detach it.
    pub fn disconnect(&mut self, reason: &str) -> usize {
        let n = self.subscribers.len();
        for sub in self.subscribers.drain(..) {
            let _ = sub.tx.send(WatchEvent::Error(Error::StreamError(reason.to_string())));
        }
        n
    }

    fn check_revision(&self, rev: u64, field: &str) -> Result<()> {
        if rev > self.revision {
            return Err(Error::invalid_input(
                field,
                rev.to_string(),
                format!("revision is newer than the current revision {}", self.revision),
            ));
        }
        Ok(())
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn remove(&mut self, key: &ResourceKey, rev: u64) -> Option<Resource> {
        let previous = self.live.remove(key)?.resource;
        self.commit(rev, WatchEvent::Deleted { previous: previous.clone(), revision: Revision::from_counter(rev) });
        Some(previous)
    }

    fn commit(&mut self, revision: u64, event: WatchEvent) {
        let key = event.key();
        self.subscribers.retain(|s| match &key {
            Some(key) if s.wants(key) => s.tx.send(event.clone()).is_ok(),
            _ => !s.tx.is_closed(),
        });
        self.history.push_back(Change { revision, event });
        while self.history.len() > self.history_limit {
            if let Some(old) = self.history.pop_front() {
                self.floor = old.revision;
            }
        }
    }

    /// State of `key` as of revision `rev` (`rev >= floor`).
    fn state_at(&self, key: &ResourceKey, rev: u64) -> Option<Resource> {
        let mut last_before: Option<&Change> = None;
        let mut first_after: Option<&Change> = None;
        for c in self.history.iter().filter(|c| c.event.key().as_ref() == Some(key)) {
            if c.revision <= rev {
                last_before = Some(c);
            } else {
                first_after = Some(c);
                break;
            }
        }
        match (last_before, first_after) {
            (Some(c), _) => c.event.object().cloned(),
            (None, Some(c)) => match &c.event {
                WatchEvent::Added(_) => None,
                other => other.previous().cloned(),
            },
            (None, None) => self.live.get(key).map(|e| e.resource.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(name: &str, v: i64) -> Resource {
        Resource::new(Kind::BGP_PEER, name, serde_json::json!({ "v": v }))
    }

    #[test]
    fn history_answers_point_in_time_reads() {
        let mut st = State::new(100);
        let a1 = st.create(res("a", 1), None).unwrap();
        let mut next = a1.clone();
        next.spec = serde_json::json!({ "v": 2 });
        let a2 = st.update(next, None).unwrap();
        st.create(res("b", 1), None).unwrap();

        let key = a1.key();
        assert_eq!(st.get(&key, Some(1)).unwrap().spec["v"], 1);
        assert_eq!(st.get(&key, Some(2)).unwrap(), a2);
        assert_eq!(st.get(&key, None).unwrap(), a2);
        assert!(st.get(&res("b", 0).key(), Some(2)).unwrap_err().is_not_found());

        let (items, rev) = st.list(&Kind::BGP_PEER, &ListOptions::default(), Some(1)).unwrap();
        assert_eq!(rev, 1);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].spec["v"], 1);
    }

    #[test]
    fn compaction_moves_the_floor() {
        let mut st = State::new(2);
        let a = st.create(res("a", 1), None).unwrap();
        st.create(res("b", 1), None).unwrap();
        st.create(res("c", 1), None).unwrap();
        assert!(st.get(&a.key(), Some(0)).unwrap_err().to_string().contains("compacted"));
        // Untouched since before the floor: served from live state.
        assert_eq!(st.get(&a.key(), Some(2)).unwrap(), a);
    }

    #[test]
    fn clean_emits_one_deletion_per_key_at_one_revision() {
        let mut st = State::new(100);
        st.create(res("a", 1), None).unwrap();
        st.create(res("b", 1), None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        st.subscribe(&Kind::BGP_PEER, &ListOptions::default(), Some(2), tx).unwrap();
        assert_eq!(st.clean(None), 2);
        let mut deleted = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            deleted.push((ev.key().unwrap().name, ev.revision().cloned()));
        }
        assert_eq!(
            deleted,
            vec![("a".to_string(), Some(Revision::from_counter(3))), ("b".to_string(), Some(Revision::from_counter(3)))]
        );
    }

    #[test]
    fn compacted_resume_fails_instead_of_dropping_deletions() {
        let mut st = State::new(2);
        let a = st.create(res("a", 1), None).unwrap();
        st.delete(&a.key(), None).unwrap();
        st.create(res("b", 1), None).unwrap();
        st.create(res("c", 1), None).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        st.subscribe(&Kind::BGP_PEER, &ListOptions::default(), Some(1), tx).unwrap();
        match rx.try_recv().unwrap() {
            WatchEvent::Error(err) => assert!(err.to_string().contains("required revision 1 has been compacted")),
            other => panic!("expected a stream error, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(st.subscriber_count(), 0);
    }

    #[test]
    fn closed_watchers_on_quiet_kinds_are_pruned_on_commit() {
        let mut st = State::new(10);
        let (tx, rx) = mpsc::unbounded_channel();
        st.subscribe(&Kind::PROFILE, &ListOptions::default(), None, tx).unwrap();
        assert_eq!(st.subscribers.len(), 1);
        drop(rx);
        st.create(res("a", 1), None).unwrap();
        assert!(st.subscribers.is_empty());
    }

    #[test]
    fn future_revisions_are_rejected() {
        let st = State::new(10);
        let err = st.get(&res("a", 0).key(), Some(5)).unwrap_err();
        assert_eq!(err.field(), Some("GetOptions.ResourceVersion"));
    }
}
