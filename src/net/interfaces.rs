//! Network interface enumeration and scoring.
//!
//! Discovery broadcasts need a sensible interface on machines that also
//! carry VPN tunnels and virtualization adapters. This module lists the
//! usable IPv4 interfaces for the UI to pick from and scores one of them
//! as the default.

use std::net::Ipv4Addr;

use if_addrs::{get_if_addrs, IfAddr};
use log::warn;
use serde::Serialize;

/// Rough classification derived from the interface name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterfaceKind {
    Ethernet,
    WiFi,
    /// Anything we could not classify further.
    Network,
}

/// One usable IPv4 interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    /// Directed broadcast address of the interface's subnet.
    pub broadcast: Ipv4Addr,
    pub kind: InterfaceKind,
}

/// Name fragments of adapters that never carry LAN game traffic.
const VIRTUAL_SUBSTRINGS: &[&str] = &[
    "virtual", "vmware", "vbox", "docker", "wsl", "hyper-v", "vethernet",
];

const VIRTUAL_PREFIXES: &[&str] = &["vmnet", "vboxnet", "virbr", "br-"];

const WIFI_HINTS: &[&str] = &["wlan", "wlp", "wlx", "wifi", "wi-fi", "wireless", "airport"];

const ETHERNET_HINTS: &[&str] = &["eth", "enp", "eno", "ens", "ethernet", "lan"];

fn is_virtual_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    VIRTUAL_SUBSTRINGS.iter().any(|s| lower.contains(s))
        || VIRTUAL_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn classify(name: &str) -> InterfaceKind {
    let lower = name.to_ascii_lowercase();
    if WIFI_HINTS.iter().any(|h| lower.contains(h)) {
        InterfaceKind::WiFi
    } else if ETHERNET_HINTS.iter().any(|h| lower.contains(h)) || lower.starts_with("en") {
        InterfaceKind::Ethernet
    } else {
        InterfaceKind::Network
    }
}

fn score(iface: &NetInterface) -> i32 {
    let mut score = 0;
    if iface.ip.is_private() {
        score += 10;
    }
    score += match iface.kind {
        InterfaceKind::Ethernet => 5,
        InterfaceKind::WiFi => 3,
        InterfaceKind::Network => 0,
    };
    score
}

fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// List every usable IPv4 interface: loopback, link-local, and
/// virtualization adapters are excluded.
pub fn enumerate() -> Vec<NetInterface> {
    let addrs = match get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("interface enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for iface in addrs {
        if iface.is_loopback() || is_virtual_name(&iface.name) {
            continue;
        }
        let IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if v4.ip.is_link_local() {
            continue;
        }
        let broadcast = v4
            .broadcast
            .unwrap_or_else(|| directed_broadcast(v4.ip, v4.netmask));
        out.push(NetInterface {
            kind: classify(&iface.name),
            name: iface.name,
            ip: v4.ip,
            broadcast,
        });
    }
    out
}

/// The highest-scoring candidate's address, falling back to loopback
/// when no interface survives the filters.
pub fn best_ip(candidates: &[NetInterface]) -> Ipv4Addr {
    candidates
        .iter()
        .max_by_key(|iface| score(iface))
        .map(|iface| iface.ip)
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Addresses this machine may be reached on, used to refuse dialing our
/// own listening endpoint.
pub fn local_ipv4s() -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = enumerate().iter().map(|i| i.ip).collect();
    ips.push(Ipv4Addr::LOCALHOST);
    ips
}
