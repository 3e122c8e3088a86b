//! High-level rule -> dataplane rule conversion.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use polsync_core::api::{EntityRule, Port, RuleSpec};
use polsync_core::model::Rule;

/// Convert one rule. Nets are validated and normalised to `addr/len` with the
/// host bits cleared; a bare address becomes a host route.
pub fn convert_rule(spec: &RuleSpec) -> Result<Rule, String> {
    if let Some(v) = spec.ip_version {
        if v != 4 && v != 6 {
            return Err(format!("invalid ipVersion {v}"));
        }
    }
    let src = Side::convert(&spec.source, spec.ip_version)?;
    let dst = Side::convert(&spec.destination, spec.ip_version)?;
    Ok(Rule {
        action: spec.action.to_string(),
        protocol: spec.protocol.map(|p| p.to_string()),
        ip_version: spec.ip_version,
        src_nets: src.nets,
        src_selector: src.selector,
        src_ports: src.ports,
        dst_nets: dst.nets,
        dst_selector: dst.selector,
        dst_ports: dst.ports,
        not_src_nets: src.not_nets,
        not_src_selector: src.not_selector,
        not_src_ports: src.not_ports,
        not_dst_nets: dst.not_nets,
        not_dst_selector: dst.not_selector,
        not_dst_ports: dst.not_ports,
    })
}

/// Convert a rule list, keeping its order. The first bad rule fails the lot.
pub fn convert_rules(specs: &[RuleSpec]) -> Result<Vec<Rule>, String> {
    specs.iter().enumerate().map(|(i, r)| convert_rule(r).map_err(|e| format!("rule {i}: {e}"))).collect()
}

struct Side {
    nets: Vec<String>,
    selector: String,
    ports: Vec<String>,
    not_nets: Vec<String>,
    not_selector: String,
    not_ports: Vec<String>,
}

impl Side {
    fn convert(e: &EntityRule, ip_version: Option<u8>) -> Result<Self, String> {
        Ok(Self {
            nets: nets(&e.nets, ip_version)?,
            selector: e.selector.clone().unwrap_or_default(),
            ports: ports(&e.ports)?,
            not_nets: nets(&e.not_nets, ip_version)?,
            not_selector: e.not_selector.clone().unwrap_or_default(),
            not_ports: ports(&e.not_ports)?,
        })
    }
}

fn nets(raw: &[String], ip_version: Option<u8>) -> Result<Vec<String>, String> {
    raw.iter().map(|n| normalize_net(n, ip_version)).collect()
}

fn ports(raw: &[Port]) -> Result<Vec<String>, String> {
    raw.iter()
        .map(|p| if p.min > p.max { Err(format!("invalid port range {}:{}", p.min, p.max)) } else { Ok(p.to_string()) })
        .collect()
}

pub fn normalize_net(net: &str, ip_version: Option<u8>) -> Result<String, String> {
    let (addr, len) = match net.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (net, None),
    };
    let ip: IpAddr = addr.trim().parse().map_err(|_| format!("invalid CIDR {net:?}"))?;
    let family = if ip.is_ipv4() { 4 } else { 6 };
    if ip_version.is_some_and(|v| v != family) {
        return Err(format!("CIDR {net:?} does not match ipVersion {}", ip_version.unwrap_or_default()));
    }
    let max: u8 = if family == 4 { 32 } else { 128 };
    let len = match len {
        Some(l) => l.trim().parse::<u8>().ok().filter(|l| *l <= max).ok_or_else(|| format!("invalid prefix length in {net:?}"))?,
        None => max,
    };
    let masked = match ip {
        IpAddr::V4(v4) => {
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len)) };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - u32::from(len)) };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    };
    Ok(format!("{masked}/{len}"))
}
