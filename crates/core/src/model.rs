//! Low-level KV model consumed by the dataplane agent.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Revision;

/// Family of low-level keys. Each family is owned by exactly one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyFamily {
    ProfileLabels,
    ProfileRules,
    BgpPeer,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LowLevelKey {
    ProfileLabels { profile: String },
    ProfileRules { profile: String },
    BgpPeer { name: String },
}

impl LowLevelKey {
    pub fn family(&self) -> KeyFamily {
        match self {
            Self::ProfileLabels { .. } => KeyFamily::ProfileLabels,
            Self::ProfileRules { .. } => KeyFamily::ProfileRules,
            Self::BgpPeer { .. } => KeyFamily::BgpPeer,
        }
    }
}

/// Dataplane path form of the key.
impl fmt::Display for LowLevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProfileLabels { profile } => write!(f, "/calico/v1/policy/profile/{profile}/labels"),
            Self::ProfileRules { profile } => write!(f, "/calico/v1/policy/profile/{profile}/rules"),
            Self::BgpPeer { name } => write!(f, "/calico/bgp/v1/peer/{name}"),
        }
    }
}

/// Flattened policy rule as evaluated by the dataplane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_nets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dst_nets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dst_ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_src_nets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub not_src_selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_src_ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_dst_nets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub not_dst_selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_dst_ports: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRules {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerScope {
    Global,
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpPeerConfig {
    pub scope: PeerScope,
    pub peer_ip: IpAddr,
    pub as_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum LowLevelValue {
    Labels(BTreeMap<String, String>),
    Rules(ProfileRules),
    BgpPeer(BgpPeerConfig),
}

/// One low-level update. `value == None` is a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: LowLevelKey,
    pub value: Option<LowLevelValue>,
    /// Revision of the originating high-level resource; absent on deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

impl KvPair {
    pub fn put(key: LowLevelKey, value: LowLevelValue, revision: Option<Revision>) -> Self {
        Self { key, value: Some(value), revision }
    }

    pub fn deletion(key: LowLevelKey) -> Self {
        Self { key, value: None, revision: None }
    }

    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }
}

/// Output of one processor call; most kinds produce one or two keys.
pub type KvUpdates = SmallVec<[KvPair; 2]>;
