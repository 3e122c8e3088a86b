//! polsync core types: resource identity, revisions, watch events, low-level
//! KV model and the datastore backend contract.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod api;
pub mod backend;
pub mod error;
pub mod model;
pub mod options;
pub mod revision;
pub mod watch;

pub use backend::{Backend, Capabilities};
pub use error::{Error, Result};
pub use revision::Revision;
pub use watch::{WatchEvent, WatchEventType, WatchSender, WatchStream};

pub mod prelude {
    pub use super::api::{BgpPeerSpec, KindSpec, ProfileSpec};
    pub use super::model::{KeyFamily, KvPair, KvUpdates, LowLevelKey, LowLevelValue};
    pub use super::options::{DeleteOptions, GetOptions, ListOptions, SetOptions};
    pub use super::{
        Backend, Capabilities, Error, Kind, ObjectMeta, Resource, ResourceKey, ResourceList, Result,
        Revision, WatchEvent, WatchEventType, WatchStream,
    };
}

/// Resource kind tag, e.g. `Profile` or `BGPPeer`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    pub const PROFILE: Kind = Kind(Cow::Borrowed("Profile"));
    pub const BGP_PEER: Kind = Kind(Cow::Borrowed("BGPPeer"));

    pub fn new(kind: impl Into<String>) -> Self {
        Self(Cow::Owned(kind.into()))
    }

    pub const fn from_static(kind: &'static str) -> Self {
        Self(Cow::Borrowed(kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one resource instance. Immutable once the resource exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }

    pub fn namespaced(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }
}

/// Renders as `Kind(name)` or `Kind(namespace/name)`; callers match on this text.
impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}({}/{})", self.kind, ns, self.name),
            None => write!(f, "{}({})", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Assigned by the store on every successful write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Revision if present and non-empty.
    pub fn revision(&self) -> Option<&Revision> {
        self.resource_version.as_ref().filter(|r| !r.is_empty())
    }
}

/// A stored resource. `S` is the spec payload: opaque JSON at the datastore
/// boundary, a typed spec at the typed client boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource<S = serde_json::Value> {
    pub kind: Kind,
    pub metadata: ObjectMeta,
    pub spec: S,
}

impl<S> Resource<S> {
    pub fn new(kind: Kind, name: impl Into<String>, spec: S) -> Self {
        Self { kind, metadata: ObjectMeta::named(name), spec }
    }

    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn revision(&self) -> Option<&Revision> {
        self.metadata.revision()
    }

    /// Convert the spec payload, keeping kind and metadata.
    pub fn try_map_spec<T, E>(self, f: impl FnOnce(S) -> std::result::Result<T, E>) -> std::result::Result<Resource<T>, E> {
        Ok(Resource { kind: self.kind, metadata: self.metadata, spec: f(self.spec)? })
    }
}

/// All live resources of one kind plus the revision a later watch resumes from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceList<S = serde_json::Value> {
    pub items: Vec<Resource<S>>,
    pub revision: Revision,
}
