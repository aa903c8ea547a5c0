//! Local address selection: which of this host's IPv4 addresses to announce.

use std::net::Ipv4Addr;

/// Direct-link (Wi-Fi Direct) group subnet, 192.168.49.0/24.
pub const DIRECT_LINK_PREFIX: [u8; 3] = [192, 168, 49];
/// Group owner address on the direct-link subnet.
pub const DIRECT_LINK_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 49, 1);

/// An IPv4 address as enumerated from a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub interface: String,
    pub ip: Ipv4Addr,
}

impl InterfaceAddr {
    pub fn new(interface: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            interface: interface.into(),
            ip,
        }
    }
}

pub fn is_direct_link(ip: Ipv4Addr) -> bool {
    ip.octets()[..3] == DIRECT_LINK_PREFIX
}

/// Heuristic for wireless interface names (wlan0, wlp2s0, p2p-wlan0-0, ap0).
pub fn is_wireless_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("wl") || name.starts_with("ap") || name.contains("p2p")
}

/// Prefer a direct-link address, then a wireless interface, then the first non-loopback IPv4.
pub fn select_local_ip(candidates: &[InterfaceAddr]) -> Option<Ipv4Addr> {
    let usable = || candidates.iter().filter(|c| !c.ip.is_loopback() && !c.ip.is_unspecified());
    usable()
        .find(|c| is_direct_link(c.ip))
        .or_else(|| usable().find(|c| is_wireless_name(&c.interface)))
        .or_else(|| usable().next())
        .map(|c| c.ip)
}
