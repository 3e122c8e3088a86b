//! Datastore backend contract.
//!
//! A backend stores untyped resources (JSON spec payload) for any number of
//! kinds and owns revision assignment. Typed validation lives in the client.

use std::time::Duration;

use async_trait::async_trait;

use crate::options::ListOptions;
use crate::{Kind, Resource, ResourceKey, ResourceList, Result, Revision, WatchStream};

/// Static capability flags; callers check these instead of probing for
/// failures at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Watch filtered to a single key.
    pub key_watch: bool,
    /// Get/List at a past revision.
    pub historical_reads: bool,
    /// Store-driven expiry of keys.
    pub ttl: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Store a new resource. Assigns revision, uid and creation timestamp.
    async fn create(&self, resource: Resource, ttl: Option<Duration>) -> Result<Resource>;

    /// Replace a live resource, conditioned on `metadata.resource_version`
    /// matching the current revision.
    async fn update(&self, resource: Resource, ttl: Option<Duration>) -> Result<Resource>;

    async fn get(&self, key: &ResourceKey, revision: Option<&Revision>) -> Result<Resource>;

    /// Remove a live resource, conditioned on `revision` when given. Returns
    /// the last live value.
    async fn delete(&self, key: &ResourceKey, revision: Option<&Revision>) -> Result<Resource>;

    /// Live resources of `kind`, sorted by key.
    async fn list(&self, kind: &Kind, opts: &ListOptions) -> Result<ResourceList>;

    async fn watch(&self, kind: &Kind, opts: &ListOptions) -> Result<WatchStream>;
}
