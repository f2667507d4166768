//! Translation from a tunnel configuration to platform network settings.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::TunnelConfig;

/// Default MTU forced on mobile profiles when the configuration leaves it
/// unset.
pub const MOBILE_DEFAULT_MTU: u16 = 1280;

/// Tunnel overhead reported on desktop profiles instead of a fixed MTU.
pub const DESKTOP_TUNNEL_OVERHEAD: u16 = 80;

/// Shortest IPv6 prefix the platform stack honors; shorter prefixes are
/// raised to this length.
pub const V6_PREFIX_FLOOR: u8 = 120;

// The platform requires a remote tunnel address; WireGuard logically has
// none or many, so a fixed placeholder is installed.
const REMOTE_PLACEHOLDER: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Host platform flavor, selecting the MTU policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Mobile,
    Desktop,
}

/// Network settings handed to the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    pub remote_address: IpAddr,
    pub ipv4_addresses: Vec<Ipv4Net>,
    pub ipv6_addresses: Vec<Ipv6Net>,
    pub included_routes: Vec<Route>,
    pub dns: Option<DnsSettings>,
    pub mtu: Option<u16>,
    pub tunnel_overhead: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub network: IpNet,
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    pub servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    /// `Some(vec![""])` routes every query through the tunnel.
    pub match_domains: Option<Vec<String>>,
}

/// Builds the platform network settings for `config`.
pub fn network_settings(config: &TunnelConfig, profile: Profile) -> NetworkSettings {
    let mut ipv4_addresses = Vec::new();
    let mut ipv6_addresses = Vec::new();
    let mut included_routes = Vec::new();

    for address in &config.interface.addresses {
        match address {
            IpNet::V4(net) => {
                ipv4_addresses.push(*net);
                included_routes.push(Route {
                    network: IpNet::V4(Ipv4Net::new(net.network(), net.prefix_len()).unwrap()),
                    gateway: Some(IpAddr::V4(net.addr())),
                });
            }
            IpNet::V6(net) => {
                let prefix = net.prefix_len().max(V6_PREFIX_FLOOR);
                let clamped = Ipv6Net::new(net.addr(), prefix).unwrap();
                ipv6_addresses.push(clamped);
                included_routes.push(Route {
                    network: IpNet::V6(Ipv6Net::new(clamped.network(), prefix).unwrap()),
                    gateway: Some(IpAddr::V6(net.addr())),
                });
            }
        }
    }

    for peer in &config.peers {
        for allowed in &peer.allowed_ips {
            included_routes.push(Route {
                network: *allowed,
                gateway: None,
            });
        }
    }

    let interface = &config.interface;
    let dns = (!interface.dns_servers.is_empty() || !interface.search_domains.is_empty()).then(
        || DnsSettings {
            servers: interface.dns_servers.clone(),
            search_domains: interface.search_domains.clone(),
            match_domains: (!interface.dns_servers.is_empty()).then(|| vec![String::new()]),
        },
    );

    let (mtu, tunnel_overhead) = match (interface.mtu, profile) {
        (None | Some(0), Profile::Mobile) => (Some(MOBILE_DEFAULT_MTU), None),
        (None | Some(0), Profile::Desktop) => (None, Some(DESKTOP_TUNNEL_OVERHEAD)),
        (Some(mtu), _) => (Some(mtu), None),
    };

    NetworkSettings {
        remote_address: IpAddr::V4(REMOTE_PLACEHOLDER),
        ipv4_addresses,
        ipv6_addresses,
        included_routes,
        dns,
        mtu,
        tunnel_overhead,
    }
}
