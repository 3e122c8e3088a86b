//! polsync resource client: typed CRUD + List + Watch for one resource kind.
//!
//! The client enforces the request preconditions (no revision on create;
//! revision, uid and creation timestamp on update), converts between the typed
//! spec and the backend's JSON payload, and applies the per-client deadline and
//! cancellation token to every call.

#![forbid(unsafe_code)]

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use polsync_core::api::KindSpec;
use polsync_core::options::{DeleteOptions, GetOptions, ListOptions, SetOptions};
use polsync_core::{
    Backend, Capabilities, Error, Kind, Resource, ResourceKey, ResourceList, Result, WatchEvent, WatchStream,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rendering of an unset creation timestamp in validation errors.
const ZERO_TIMESTAMP: &str = "0001-01-01 00:00:00 +0000 UTC";
const DEFAULT_WATCH_BUFFER: usize = 256;

/// Client for one resource kind. Cheap to clone.
pub struct ResourceClient<S = serde_json::Value> {
    backend: Arc<dyn Backend>,
    kind: Kind,
    namespace: Option<String>,
    deadline: Option<Duration>,
    cancel: CancellationToken,
    watch_buffer: usize,
    _spec: PhantomData<fn() -> S>,
}

impl<S> Clone for ResourceClient<S> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            watch_buffer: self.watch_buffer,
            _spec: PhantomData,
        }
    }
}

impl<S: KindSpec> ResourceClient<S> {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::for_kind(backend, S::KIND)
    }
}

impl<S> ResourceClient<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    /// Client for an arbitrary kind; `ResourceClient<serde_json::Value>` is the
    /// untyped form the syncer consumes.
    pub fn for_kind(backend: Arc<dyn Backend>, kind: Kind) -> Self {
        Self {
            backend,
            kind,
            namespace: None,
            deadline: None,
            cancel: CancellationToken::new(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
            _spec: PhantomData,
        }
    }

    /// Scope every call to one namespace.
    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Fail any call that takes longer than `deadline` with `Cancelled`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fail calls with `Cancelled` once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_watch_buffer(mut self, buffer: usize) -> Self {
        self.watch_buffer = buffer.max(1);
        self
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Build a resource of this client's kind (and namespace).
    pub fn resource(&self, name: impl Into<String>, spec: S) -> Resource<S> {
        let mut r = Resource::new(self.kind.clone(), name, spec);
        r.metadata.namespace = self.namespace.clone();
        r
    }

    pub fn key(&self, name: &str) -> ResourceKey {
        ResourceKey { kind: self.kind.clone(), namespace: self.namespace.clone(), name: name.to_string() }
    }

    pub async fn create(&self, resource: Resource<S>, opts: SetOptions) -> Result<Resource<S>> {
        let resource = self.prepare(resource)?;
        if let Some(rev) = &resource.metadata.resource_version {
            if !rev.is_empty() {
                return Err(Error::invalid_input(
                    "Metadata.ResourceVersion",
                    rev.as_str(),
                    "field must not be set for a Create request",
                ));
            }
        }
        self.check_ttl(&opts)?;
        let raw = encode(resource)?;
        let out = self.run("create", self.backend.create(raw, opts.ttl)).await?;
        decode(out)
    }

    pub async fn update(&self, resource: Resource<S>, opts: SetOptions) -> Result<Resource<S>> {
        let resource = self.prepare(resource)?;
        let meta = &resource.metadata;
        if meta.revision().is_none() {
            return Err(Error::invalid_input("Metadata.ResourceVersion", "", "field must be set for an Update request"));
        }
        if meta.creation_timestamp.is_none() {
            return Err(Error::invalid_input(
                "Metadata.CreationTimestamp",
                ZERO_TIMESTAMP,
                "field must be set for an Update request",
            ));
        }
        if meta.uid.as_deref().map_or(true, str::is_empty) {
            return Err(Error::invalid_input("Metadata.UID", "", "field must be set for an Update request"));
        }
        self.check_ttl(&opts)?;
        let raw = encode(resource)?;
        let out = self.run("update", self.backend.update(raw, opts.ttl)).await?;
        decode(out)
    }

    pub async fn get(&self, name: &str, opts: GetOptions) -> Result<Resource<S>> {
        let key = self.key(name);
        let rev = opts.resource_version.as_ref().filter(|r| !r.is_empty());
        if let Some(rev) = rev {
            if !self.backend.capabilities().historical_reads {
                return Err(Error::invalid_input(
                    "GetOptions.ResourceVersion",
                    rev.as_str(),
                    format!("point-in-time reads are not supported by the {} datastore", self.backend.name()),
                ));
            }
        }
        let out = self.run("get", self.backend.get(&key, rev)).await?;
        decode(out)
    }

    pub async fn delete(&self, name: &str, opts: DeleteOptions) -> Result<Resource<S>> {
        let key = self.key(name);
        let rev = opts.resource_version.as_ref().filter(|r| !r.is_empty());
        let out = self.run("delete", self.backend.delete(&key, rev)).await?;
        decode(out)
    }

    /// List the kind. A revision is served exactly when the backend keeps
    /// history, otherwise as a not-older-than lower bound.
    pub async fn list(&self, opts: ListOptions) -> Result<ResourceList<S>> {
        let opts = self.scope(opts);
        let out = self.run("list", self.backend.list(&self.kind, &opts)).await?;
        let items = out.items.into_iter().map(decode).collect::<Result<Vec<_>>>()?;
        Ok(ResourceList { items, revision: out.revision })
    }

    /// Start a watch stream. Without a revision the stream opens with a
    /// snapshot of every live key; with one it resumes strictly after it.
    pub async fn watch(&self, opts: ListOptions) -> Result<WatchStream<S>> {
        let opts = self.scope(opts);
        if let Some(name) = &opts.name {
            if !self.backend.capabilities().key_watch {
                return Err(Error::invalid_input(
                    "ListOptions.Name",
                    name.as_str(),
                    format!("single-key watch is not supported by the {} datastore", self.backend.name()),
                ));
            }
        }
        let mut raw = self.run("watch", self.backend.watch(&self.kind, &opts)).await?;
        let (tx, stream) = WatchStream::channel(self.watch_buffer);
        let kind = self.kind.clone();
        tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    biased;
                    _ = tx.cancelled() => break,
                    ev = raw.next() => ev,
                };
                let Some(ev) = ev else { break };
                let ev = ev.try_map(decode::<S>).unwrap_or_else(|e| {
                    warn!(kind = %kind, error = %e, "watch: undecodable event; closing stream");
                    WatchEvent::Error(e)
                });
                let fatal = ev.is_error();
                if !tx.send(ev).await || fatal {
                    break;
                }
            }
            raw.stop();
            debug!(kind = %kind, "watch: relay stopped");
        });
        Ok(stream)
    }

    fn prepare(&self, mut resource: Resource<S>) -> Result<Resource<S>> {
        if resource.kind != self.kind {
            return Err(Error::KindMismatch { expected: self.kind.clone(), actual: resource.kind });
        }
        if resource.metadata.name.is_empty() {
            return Err(Error::invalid_input("Metadata.Name", "", "field must be set"));
        }
        if resource.metadata.namespace.is_none() {
            resource.metadata.namespace = self.namespace.clone();
        }
        Ok(resource)
    }

    fn scope(&self, mut opts: ListOptions) -> ListOptions {
        if opts.namespace.is_none() {
            opts.namespace = self.namespace.clone();
        }
        if opts.resource_version.as_ref().is_some_and(|r| r.is_empty()) {
            opts.resource_version = None;
        }
        opts
    }

    fn check_ttl(&self, opts: &SetOptions) -> Result<()> {
        match opts.ttl {
            Some(ttl) if !self.backend.capabilities().ttl => Err(Error::invalid_input(
                "Options.TTL",
                format!("{ttl:?}"),
                format!("field is not supported by the {} datastore", self.backend.name()),
            )),
            _ => Ok(()),
        }
    }

    /// Run one backend call under the deadline and cancellation token. The
    /// call future is polled first, so a call that completes is never
    /// reported as cancelled.
    async fn run<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled { reason: format!("{op} {}: context cancelled", self.kind) });
        }
        let started = Instant::now();
        let bounded = async {
            match self.deadline {
                Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::Cancelled {
                    reason: format!("{op} {}: deadline of {d:?} exceeded", self.kind),
                })?,
                None => fut.await,
            }
        };
        let res = tokio::select! {
            biased;
            res = bounded => res,
            _ = self.cancel.cancelled() => Err(Error::Cancelled { reason: format!("{op} {}: context cancelled", self.kind) }),
        };
        histogram!("client_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        match &res {
            Ok(_) => counter!("client_requests_total", 1u64, "op" => op, "kind" => self.kind.to_string()),
            Err(e) => {
                counter!("client_errors_total", 1u64, "op" => op, "kind" => self.kind.to_string());
                debug!(kind = %self.kind, op, error = %e, "client: request failed");
            }
        }
        res
    }
}

fn encode<S: Serialize>(resource: Resource<S>) -> Result<Resource> {
    let key = resource.key();
    resource.try_map_spec(|spec| {
        serde_json::to_value(spec).map_err(|e| Error::ConversionFailure { key, reason: e.to_string() })
    })
}

fn decode<S: DeserializeOwned>(resource: Resource) -> Result<Resource<S>> {
    let key = resource.key();
    resource.try_map_spec(|spec| {
        serde_json::from_value(spec).map_err(|e| Error::ConversionFailure { key, reason: e.to_string() })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use polsync_core::api::BgpPeerSpec;
    use polsync_core::Revision;
    use polsync_store::MemoryBackend;

    fn spec() -> BgpPeerSpec {
        BgpPeerSpec { node: None, peer_ip: "10.0.0.1".into(), as_number: 64512 }
    }

    fn client() -> ResourceClient<BgpPeerSpec> {
        ResourceClient::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_rejects_caller_supplied_revision() {
        let c = client();
        let mut r = c.resource("bgppeer-1", spec());
        r.metadata.resource_version = Some(Revision::from("12345"));
        let err = c.create(r, SetOptions::default()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error with field Metadata.ResourceVersion = '12345' (field must not be set for a Create request)"
        );
    }

    #[tokio::test]
    async fn update_names_each_missing_precondition() {
        let c = client();
        let created = c.create(c.resource("bgppeer-1", spec()), SetOptions::default()).await.unwrap();

        let mut r = created.clone();
        r.metadata.resource_version = None;
        let err = c.update(r, SetOptions::default()).await.unwrap_err();
        assert_eq!(err.field(), Some("Metadata.ResourceVersion"));

        let mut r = created.clone();
        r.metadata.creation_timestamp = None;
        let err = c.update(r, SetOptions::default()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error with field Metadata.CreationTimestamp = '0001-01-01 00:00:00 +0000 UTC' (field must be set for an Update request)"
        );

        let mut r = created;
        r.metadata.uid = None;
        let err = c.update(r, SetOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "error with field Metadata.UID = '' (field must be set for an Update request)");
    }

    #[tokio::test]
    async fn cancelled_token_fails_without_writing() {
        let token = CancellationToken::new();
        let c = client().with_cancellation(token.clone());
        token.cancel();
        let err = c.create(c.resource("bgppeer-1", spec()), SetOptions::default()).await.unwrap_err();
        assert!(err.is_cancelled());

        let fresh = ResourceClient::<BgpPeerSpec>::new(Arc::clone(c.backend()));
        assert!(fresh.get("bgppeer-1", GetOptions::default()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected() {
        let c = client();
        let r = Resource::new(Kind::PROFILE, "p", spec());
        let err = c.create(r, SetOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::KindMismatch { .. }));
    }
}
