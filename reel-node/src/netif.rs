//! Network interface enumeration feeding the local address policy in reel-core.

use std::net::Ipv4Addr;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use reel_core::{select_local_ip, InterfaceAddr};
use tracing::debug;

/// All IPv4 addresses on this host, tagged with their interface name.
pub fn interface_addrs() -> Vec<InterfaceAddr> {
    let interfaces = match NetworkInterface::show() {
        Ok(list) => list,
        Err(e) => {
            debug!(error = %e, "interface enumeration failed");
            return Vec::new();
        }
    };
    interfaces
        .iter()
        .flat_map(|iface| {
            iface.addr.iter().filter_map(move |a| match a {
                Addr::V4(v4) => Some(InterfaceAddr::new(iface.name.clone(), v4.ip)),
                Addr::V6(_) => None,
            })
        })
        .collect()
}

/// Best address to announce: direct-link, then wireless, then first non-loopback.
pub fn best_local_ip() -> Option<Ipv4Addr> {
    select_local_ip(&interface_addrs())
}
