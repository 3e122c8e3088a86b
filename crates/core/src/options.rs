//! Per-call options for the resource client API.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Revision;

/// Options for create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOptions {
    /// Expire the key this long after the write succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Point-in-time read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<Revision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Delete precondition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<Revision>,
}

/// Options for list and watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Single-key filter (watch requires the `key_watch` capability).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// List snapshot revision, or the watch resume token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<Revision>,
}

impl ListOptions {
    pub fn from_revision(rev: Revision) -> Self {
        Self { resource_version: Some(rev), ..Self::default() }
    }

    pub fn for_name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// Whether a resource with this namespace/name passes the filters.
    pub fn matches(&self, namespace: Option<&str>, name: &str) -> bool {
        self.name.as_deref().map_or(true, |n| n == name)
            && self.namespace.as_deref().map_or(true, |ns| Some(ns) == namespace)
    }
}
