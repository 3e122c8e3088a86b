use std::net::IpAddr;

use polsync_core::api::{BgpPeerSpec, KindSpec};
use polsync_core::model::{BgpPeerConfig, KeyFamily, LowLevelKey, LowLevelValue, PeerScope};
use polsync_core::{Resource, ResourceKey};

use crate::processor::SimpleProcessor;

/// `BGPPeer(name)` -> one peer key carrying scope, peer IP and AS number.
pub fn bgp_peer_processor() -> SimpleProcessor<BgpPeerSpec> {
    SimpleProcessor::new(BgpPeerSpec::KIND, KeyFamily::BgpPeer, peer_key, convert)
}

fn peer_key(key: &ResourceKey) -> LowLevelKey {
    LowLevelKey::BgpPeer { name: key.name.clone() }
}

fn convert(res: &Resource<BgpPeerSpec>) -> Result<LowLevelValue, String> {
    let peer_ip: IpAddr =
        res.spec.peer_ip.trim().parse().map_err(|_| format!("invalid peer IP {:?}", res.spec.peer_ip))?;
    let scope = match res.spec.node.as_deref().filter(|n| !n.is_empty()) {
        Some(node) => PeerScope::Node(node.to_string()),
        None => PeerScope::Global,
    };
    Ok(LowLevelValue::BgpPeer(BgpPeerConfig { scope, peer_ip, as_number: res.spec.as_number }))
}
