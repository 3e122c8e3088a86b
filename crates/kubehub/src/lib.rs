//! polsync kubehub: Kubernetes custom-resource backend.
//!
//! Resources live as custom objects under one group/version; the typed spec is
//! kept verbatim under `spec`. Revisions are the API server's
//! `resourceVersion`, so there are no historical reads, no single-key watch
//! and no store-driven TTL.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions, VersionMatch, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent as KubeEvent},
    Client,
};
use metrics::counter;
use polsync_core::options::ListOptions;
use polsync_core::{
    Backend, Capabilities, Error, Kind, ObjectMeta, Resource, ResourceKey, ResourceList, Result, Revision, WatchEvent,
    WatchSender, WatchStream,
};
use tracing::{debug, info, warn};

pub const DEFAULT_GROUP: &str = "crd.projectcalico.org";
pub const DEFAULT_VERSION: &str = "v1";
const WATCH_BUFFER: usize = 256;

/// Where the custom resources are served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeConfig {
    pub group: String,
    pub version: String,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self { group: DEFAULT_GROUP.to_string(), version: DEFAULT_VERSION.to_string() }
    }
}

impl KubeConfig {
    /// `POLSYNC_GROUP` / `POLSYNC_VERSION`, falling back to the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            group: std::env::var("POLSYNC_GROUP").ok().filter(|s| !s.is_empty()).unwrap_or(d.group),
            version: std::env::var("POLSYNC_VERSION").ok().filter(|s| !s.is_empty()).unwrap_or(d.version),
        }
    }
}

#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    cfg: KubeConfig,
}

impl KubeBackend {
    pub fn new(client: Client, cfg: KubeConfig) -> Self {
        Self { client, cfg }
    }

    /// Connect with the ambient kubeconfig / in-cluster credentials.
    pub async fn try_default(cfg: KubeConfig) -> AnyResult<Self> {
        let client = Client::try_default().await.context("building kube client from the default config")?;
        info!(group = %cfg.group, version = %cfg.version, "kubehub: connected");
        Ok(Self::new(client, cfg))
    }

    pub fn config(&self) -> &KubeConfig {
        &self.cfg
    }

    fn api_resource(&self, kind: &Kind) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.cfg.group, &self.cfg.version, kind.as_str());
        ApiResource::from_gvk_with_plural(&gvk, &plural(kind))
    }

    fn api(&self, kind: &Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = self.api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

/// `BGPPeer` -> `bgppeers`.
fn plural(kind: &Kind) -> String {
    format!("{}s", kind.as_str().to_ascii_lowercase())
}

fn to_dynamic(resource: &Resource, ar: &ApiResource) -> DynamicObject {
    let mut obj = DynamicObject::new(&resource.metadata.name, ar);
    obj.metadata.namespace = resource.metadata.namespace.clone();
    obj.metadata.resource_version = resource.metadata.revision().map(|r| r.as_str().to_string());
    obj.metadata.uid = resource.metadata.uid.clone();
    obj.data = serde_json::json!({ "spec": resource.spec });
    obj
}

fn from_dynamic(kind: &Kind, obj: DynamicObject) -> Result<Resource> {
    let meta = obj.metadata;
    let name = meta.name.filter(|n| !n.is_empty()).ok_or_else(|| {
        Error::ConversionFailure {
            key: ResourceKey::new(kind.clone(), ""),
            reason: "object has no metadata.name".to_string(),
        }
    })?;
    let spec = match obj.data {
        serde_json::Value::Object(mut m) => m.remove("spec").unwrap_or_else(|| serde_json::json!({})),
        _ => serde_json::json!({}),
    };
    Ok(Resource {
        kind: kind.clone(),
        metadata: ObjectMeta {
            name,
            namespace: meta.namespace,
            resource_version: meta.resource_version.map(Revision::from),
            uid: meta.uid,
            creation_timestamp: meta.creation_timestamp.map(|t| t.0),
        },
        spec,
    })
}

fn map_err(key: &ResourceKey, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(key.clone(), ae.message),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists { key: key.clone() }
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict { key: key.clone() },
        kube::Error::Api(ae) if ae.code == 422 || ae.code == 400 => {
            Error::invalid_input("Metadata", key.to_string(), ae.message)
        }
        other => Error::Datastore(other.to_string()),
    }
}

fn reject_ttl(ttl: Option<Duration>) -> Result<()> {
    match ttl {
        Some(ttl) => Err(Error::invalid_input("Options.TTL", format!("{ttl:?}"), "field is not supported by the kubernetes datastore")),
        None => Ok(()),
    }
}

fn record(op: &'static str, ok: bool) {
    if ok {
        counter!("kube_requests_total", 1u64, "op" => op);
    } else {
        counter!("kube_errors_total", 1u64, "op" => op);
    }
}

#[async_trait]
impl Backend for KubeBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { key_watch: false, historical_reads: false, ttl: false }
    }

    async fn create(&self, resource: Resource, ttl: Option<Duration>) -> Result<Resource> {
        reject_ttl(ttl)?;
        let key = resource.key();
        let ar = self.api_resource(&key.kind);
        let api = self.api(&key.kind, key.namespace.as_deref());
        let res = api.create(&PostParams::default(), &to_dynamic(&resource, &ar)).await;
        record("create", res.is_ok());
        from_dynamic(&key.kind, res.map_err(|e| map_err(&key, e))?)
    }

    async fn update(&self, resource: Resource, ttl: Option<Duration>) -> Result<Resource> {
        reject_ttl(ttl)?;
        let key = resource.key();
        let ar = self.api_resource(&key.kind);
        let api = self.api(&key.kind, key.namespace.as_deref());
        // Replace carries resourceVersion, so the API server enforces the precondition.
        let res = api.replace(&key.name, &PostParams::default(), &to_dynamic(&resource, &ar)).await;
        record("update", res.is_ok());
        from_dynamic(&key.kind, res.map_err(|e| map_err(&key, e))?)
    }

    async fn get(&self, key: &ResourceKey, revision: Option<&Revision>) -> Result<Resource> {
        if let Some(rev) = revision {
            return Err(Error::invalid_input(
                "GetOptions.ResourceVersion",
                rev.as_str(),
                "historical reads are not supported by the kubernetes datastore",
            ));
        }
        let res = self.api(&key.kind, key.namespace.as_deref()).get(&key.name).await;
        record("get", res.is_ok());
        from_dynamic(&key.kind, res.map_err(|e| map_err(key, e))?)
    }

    async fn delete(&self, key: &ResourceKey, revision: Option<&Revision>) -> Result<Resource> {
        let last = self.get(key, None).await?;
        if let Some(rev) = revision {
            if last.revision() != Some(rev) {
                return Err(Error::Conflict { key: key.clone() });
            }
        }
        let dp = delete_params(revision);
        let res = self.api(&key.kind, key.namespace.as_deref()).delete(&key.name, &dp).await;
        record("delete", res.is_ok());
        res.map_err(|e| map_err(key, e))?;
        Ok(last)
    }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> Result<ResourceList> {
        let mut lp = ListParams::default();
        if let Some(rev) = &opts.resource_version {
            lp = lp.at(rev.as_str()).matching(VersionMatch::NotOlderThan);
        }
        let key = ResourceKey::new(kind.clone(), opts.name.clone().unwrap_or_default());
        let res = self.api(kind, opts.namespace.as_deref()).list(&lp).await;
        record("list", res.is_ok());
        let list = res.map_err(|e| map_err(&key, e))?;
        let revision = Revision::from(list.metadata.resource_version.unwrap_or_default());
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let r = from_dynamic(kind, obj)?;
            if opts.matches(r.metadata.namespace.as_deref(), &r.metadata.name) {
                items.push(r);
            }
        }
        items.sort_by(|a, b| a.key().cmp(&b.key()));
        debug!(kind = %kind, count = items.len(), rev = %revision, "kubehub: listed");
        Ok(ResourceList { items, revision })
    }

    async fn watch(&self, kind: &Kind, opts: &ListOptions) -> Result<WatchStream> {
        if let Some(name) = &opts.name {
            return Err(Error::invalid_input(
                "ListOptions.Name",
                name.as_str(),
                "single-key watch is not supported by the kubernetes datastore",
            ));
        }
        // Without a revision, open with a snapshot and resume from its revision.
        let (snapshot, from) = match &opts.resource_version {
            Some(rev) => (Vec::new(), rev.clone()),
            None => {
                let list = self.list(kind, opts).await?;
                (list.items, list.revision)
            }
        };
        let (tx, stream) = WatchStream::channel(WATCH_BUFFER);
        let relay = Relay { kind: kind.clone(), api: self.api(kind, opts.namespace.as_deref()), tx, known: BTreeMap::new() };
        tokio::spawn(relay.run(snapshot, from));
        Ok(stream)
    }
}

/// Only a caller-supplied revision becomes a precondition; an unconditional
/// delete must not fail because the object moved after it was read.
fn delete_params(revision: Option<&Revision>) -> DeleteParams {
    DeleteParams {
        preconditions: revision
            .map(|rev| Preconditions { resource_version: Some(rev.as_str().to_string()), uid: None }),
        ..DeleteParams::default()
    }
}

/// Pumps one kube watch into a `WatchStream`, remembering the last object per
/// key so `Modified` can carry its predecessor.
struct Relay {
    kind: Kind,
    api: Api<DynamicObject>,
    tx: WatchSender,
    known: BTreeMap<ResourceKey, Resource>,
}

impl Relay {
    async fn run(mut self, snapshot: Vec<Resource>, from: Revision) {
        for r in snapshot {
            self.known.insert(r.key(), r.clone());
            if !self.tx.send(WatchEvent::Added(r)).await {
                return;
            }
        }
        let wp = WatchParams::default();
        let stream = match self.api.watch(&wp, from.as_str()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "kubehub: watch request failed");
                self.tx.send(WatchEvent::Error(Error::StreamError(e.to_string()))).await;
                return;
            }
        };
        futures::pin_mut!(stream);
        info!(kind = %self.kind, from = %from, "kubehub: watch started");
        loop {
            let item = tokio::select! {
                biased;
                _ = self.tx.cancelled() => break,
                item = stream.try_next() => item,
            };
            let ev = match item {
                Ok(Some(ev)) => match translate(&self.kind, &mut self.known, ev) {
                    Some(ev) => ev,
                    None => continue,
                },
                Ok(None) => WatchEvent::Error(Error::StreamError("watch stream ended by the server".to_string())),
                Err(e) => WatchEvent::Error(Error::StreamError(e.to_string())),
            };
            let fatal = ev.is_error();
            counter!("kube_watch_events_total", 1u64, "kind" => self.kind.to_string());
            if !self.tx.send(ev).await || fatal {
                break;
            }
        }
        debug!(kind = %self.kind, "kubehub: watch closed");
    }
}

/// Map one kube event, tracking the last object per key in `known`. The
/// event type is kept as the server reported it; `known` only supplies
/// `Modified.previous`, which stays empty for objects not seen yet.
fn translate(
    kind: &Kind,
    known: &mut BTreeMap<ResourceKey, Resource>,
    ev: KubeEvent<DynamicObject>,
) -> Option<WatchEvent> {
    match ev {
        KubeEvent::Added(obj) => {
            let r = match from_dynamic(kind, obj) {
                Ok(r) => r,
                Err(e) => return Some(WatchEvent::Error(e)),
            };
            known.insert(r.key(), r.clone());
            Some(WatchEvent::Added(r))
        }
        KubeEvent::Modified(obj) => {
            let r = match from_dynamic(kind, obj) {
                Ok(r) => r,
                Err(e) => return Some(WatchEvent::Error(e)),
            };
            let previous = known.insert(r.key(), r.clone());
            Some(WatchEvent::Modified { previous, object: r })
        }
        KubeEvent::Deleted(obj) => {
            let r = match from_dynamic(kind, obj) {
                Ok(r) => r,
                Err(e) => return Some(WatchEvent::Error(e)),
            };
            known.remove(&r.key());
            let revision = r.revision().cloned().unwrap_or_default();
            Some(WatchEvent::Deleted { previous: r, revision })
        }
        KubeEvent::Bookmark(_) => None,
        KubeEvent::Error(ae) => Some(WatchEvent::Error(Error::StreamError(format!("{} ({})", ae.message, ae.code)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn ar() -> ApiResource {
        let gvk = GroupVersionKind::gvk(DEFAULT_GROUP, DEFAULT_VERSION, "BGPPeer");
        ApiResource::from_gvk_with_plural(&gvk, "bgppeers")
    }

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn plural_is_lowercased() {
        assert_eq!(plural(&Kind::BGP_PEER), "bgppeers");
        assert_eq!(plural(&Kind::PROFILE), "profiles");
    }

    #[test]
    fn spec_and_metadata_survive_conversion() {
        let mut r = Resource::new(Kind::BGP_PEER, "peer-1", serde_json::json!({ "peerIP": "10.0.0.1", "asNumber": 6512 }));
        r.metadata.resource_version = Some(Revision::from("42"));
        r.metadata.uid = Some("u-1".into());
        let obj = to_dynamic(&r, &ar());
        assert_eq!(obj.data["spec"]["asNumber"], 6512);
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(obj.types.as_ref().map(|t| t.kind.as_str()), Some("BGPPeer"));

        let back = from_dynamic(&Kind::BGP_PEER, obj).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn nameless_object_is_a_conversion_failure() {
        let obj = DynamicObject::new("", &ar());
        let err = from_dynamic(&Kind::BGP_PEER, obj).unwrap_err();
        assert!(matches!(err, Error::ConversionFailure { .. }));
    }

    #[test]
    fn api_errors_map_to_client_errors() {
        let key = ResourceKey::new(Kind::BGP_PEER, "peer-1");
        assert!(map_err(&key, api_err(404, "NotFound")).is_not_found());
        assert!(map_err(&key, api_err(409, "AlreadyExists")).is_already_exists());
        assert!(map_err(&key, api_err(409, "Conflict")).is_conflict());
        assert_eq!(map_err(&key, api_err(422, "Invalid")).field(), Some("Metadata"));
        assert!(matches!(map_err(&key, api_err(500, "InternalError")), Error::Datastore(_)));
    }

    fn peer_obj(name: &str, rv: &str) -> DynamicObject {
        let mut r = Resource::new(Kind::BGP_PEER, name, serde_json::json!({ "peerIP": "10.0.0.1", "asNumber": 1 }));
        r.metadata.resource_version = Some(Revision::from(rv));
        to_dynamic(&r, &ar())
    }

    #[test]
    fn modification_of_an_unseen_object_stays_a_modification() {
        let mut known = BTreeMap::new();
        let ev = translate(&Kind::BGP_PEER, &mut known, KubeEvent::Modified(peer_obj("peer-1", "7"))).unwrap();
        let WatchEvent::Modified { previous, object } = ev else { panic!("expected Modified, got {ev:?}") };
        assert!(previous.is_none());
        assert_eq!(object.revision(), Some(&Revision::from("7")));

        let ev = translate(&Kind::BGP_PEER, &mut known, KubeEvent::Modified(peer_obj("peer-1", "8"))).unwrap();
        let WatchEvent::Modified { previous, .. } = ev else { panic!("expected Modified, got {ev:?}") };
        assert_eq!(previous.and_then(|p| p.metadata.resource_version), Some(Revision::from("7")));
    }

    #[test]
    fn added_then_deleted_clears_the_cache() {
        let mut known = BTreeMap::new();
        let ev = translate(&Kind::BGP_PEER, &mut known, KubeEvent::Added(peer_obj("peer-1", "3"))).unwrap();
        assert!(matches!(ev, WatchEvent::Added(_)));
        assert_eq!(known.len(), 1);
        let ev = translate(&Kind::BGP_PEER, &mut known, KubeEvent::Deleted(peer_obj("peer-1", "5"))).unwrap();
        assert_eq!(ev.revision(), Some(&Revision::from("5")));
        assert!(known.is_empty());
    }

    #[test]
    fn only_caller_revisions_become_delete_preconditions() {
        assert!(delete_params(None).preconditions.is_none());
        let dp = delete_params(Some(&Revision::from("12")));
        assert_eq!(dp.preconditions.and_then(|p| p.resource_version).as_deref(), Some("12"));
    }

    #[test]
    fn config_reads_the_environment() {
        std::env::set_var("POLSYNC_VERSION", "v2");
        let cfg = KubeConfig::from_env();
        std::env::remove_var("POLSYNC_VERSION");
        assert_eq!(cfg.version, "v2");
        assert_eq!(cfg.group, DEFAULT_GROUP);
    }

    #[test]
    fn ttl_is_rejected() {
        assert_eq!(reject_ttl(Some(Duration::from_secs(2))).unwrap_err().field(), Some("Options.TTL"));
        assert!(reject_ttl(None).is_ok());
    }
}
