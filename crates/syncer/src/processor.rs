//! Update processor contract and the generic one-key processor.

use std::marker::PhantomData;

use polsync_core::model::{KeyFamily, KvPair, KvUpdates, LowLevelKey, LowLevelValue};
use polsync_core::{Error, Kind, Resource, ResourceKey, Result, Revision};
use serde::de::DeserializeOwned;
use smallvec::smallvec;
use tracing::warn;

/// One high-level mutation as seen by a processor. `value == None` is a
/// deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub key: ResourceKey,
    pub value: Option<Resource>,
    pub revision: Option<Revision>,
}

impl ResourceUpdate {
    pub fn upsert(resource: Resource) -> Self {
        Self { key: resource.key(), revision: resource.revision().cloned(), value: Some(resource) }
    }

    pub fn deletion(key: ResourceKey, revision: Option<Revision>) -> Self {
        Self { key, value: None, revision }
    }
}

/// Reduces high-level resources of one kind into low-level KV pairs.
pub trait UpdateProcessor: Send + 'static {
    fn kind(&self) -> &Kind;

    /// Every low-level key family this processor may emit.
    fn families(&self) -> &[KeyFamily];

    /// A deletion, or a value that cannot be converted, yields a `None`-valued
    /// pair for every key the resource owns. Errors are contract violations.
    fn process(&mut self, update: &ResourceUpdate) -> Result<KvUpdates>;

    /// Called once per pipeline generation before any update.
    fn on_syncer_starting(&mut self) {}
}

/// Kind and name checks shared by every processor.
pub(crate) fn check_key(kind: &Kind, update: &ResourceUpdate) -> Result<()> {
    if &update.key.kind != kind {
        return Err(Error::KindMismatch { expected: kind.clone(), actual: update.key.kind.clone() });
    }
    if update.key.name.is_empty() {
        return Err(Error::invalid_input("Name", "", "a name is required to build a low-level key"));
    }
    Ok(())
}

/// Decode the typed spec, or `None` (after a warning) when it does not fit.
pub(crate) fn typed_spec<S: DeserializeOwned>(update: &ResourceUpdate) -> Option<Resource<S>> {
    let res = update.value.clone()?;
    match res.try_map_spec(serde_json::from_value::<S>) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(key = %update.key, error = %e, "unable to decode resource; treating as deleted");
            None
        }
    }
}

type KeyFn = fn(&ResourceKey) -> LowLevelKey;
type ConvertFn<S> = fn(&Resource<S>) -> std::result::Result<LowLevelValue, String>;

/// Processor for kinds that map one resource to exactly one low-level key.
pub struct SimpleProcessor<S> {
    kind: Kind,
    families: [KeyFamily; 1],
    key: KeyFn,
    convert: ConvertFn<S>,
    _spec: PhantomData<fn() -> S>,
}

impl<S: DeserializeOwned + 'static> SimpleProcessor<S> {
    pub fn new(kind: Kind, family: KeyFamily, key: KeyFn, convert: ConvertFn<S>) -> Self {
        Self { kind, families: [family], key, convert, _spec: PhantomData }
    }
}

impl<S: DeserializeOwned + 'static> UpdateProcessor for SimpleProcessor<S> {
    fn kind(&self) -> &Kind {
        &self.kind
    }

    fn families(&self) -> &[KeyFamily] {
        &self.families
    }

    fn process(&mut self, update: &ResourceUpdate) -> Result<KvUpdates> {
        check_key(&self.kind, update)?;
        let key = (self.key)(&update.key);
        let value = typed_spec::<S>(update).and_then(|r| match (self.convert)(&r) {
            Ok(v) => Some(v),
            Err(reason) => {
                warn!(key = %update.key, reason = %reason, "unable to convert resource; treating as deleted");
                None
            }
        });
        Ok(match value {
            Some(v) => smallvec![KvPair::put(key, v, update.revision.clone())],
            None => smallvec![KvPair::deletion(key)],
        })
    }
}
