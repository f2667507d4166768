use std::{
    fmt,
    net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

pub use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use rand::rngs::OsRng;

/// Tunnel configuration
#[derive(Clone)]
pub struct TunnelConfig {
    /// Local interface configuration
    pub interface: Interface,
    /// Remote peer configurations, in priority order
    ///
    /// The first peer with a literal endpoint becomes the active peer of the
    /// tunnel session.
    pub peers: Vec<Peer>,
}

/// Local interface configuration
#[derive(Clone)]
pub struct Interface {
    /// Private key of the local peer
    pub private_key: StaticSecret,
    /// Addresses assigned to the tunnel interface, with prefix lengths
    pub addresses: Vec<IpNet>,
    /// DNS servers to use inside the tunnel
    pub dns_servers: Vec<IpAddr>,
    /// DNS search domains
    pub search_domains: Vec<String>,
    /// MTU
    ///
    /// `None` or `Some(0)` selects the platform default policy.
    pub mtu: Option<u16>,
}

/// Remote peer configuration
#[derive(Debug, Clone)]
pub struct Peer {
    /// Public key of the remote peer
    pub public_key: PublicKey,
    /// Optional preshared key
    ///
    /// Carried for configuration fidelity; the engine's parameter block has
    /// no slot for it.
    pub preshared_key: Option<[u8; 32]>,
    /// Endpoint of the remote peer
    ///
    /// Hostname resolution is the caller's job. Endpoints that are not
    /// literal addresses never produce a transport session.
    pub endpoint: Option<Endpoint>,
    /// IP ranges routed into the tunnel and accepted as source from it
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval at which the peer is pinged
    pub persistent_keepalive: Option<u16>,
}

/// A peer endpoint, discriminated by address family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    /// A hostname the caller has not resolved
    Named { host: String, port: u16 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum EndpointFromStrErr {
    MissingPort,
    InvalidPort,
    Empty,
}

impl TunnelConfig {
    /// Returns the first peer together with its literal endpoint address
    ///
    /// Peers without an endpoint, and peers whose endpoint is an unresolved
    /// hostname, do not qualify.
    pub fn active_peer(&self) -> Option<(&Peer, SocketAddr)> {
        let peer = self.peers.first()?;
        let endpoint = peer.endpoint.as_ref()?.socket_addr()?;
        Some((peer, endpoint))
    }
}

impl Endpoint {
    /// Returns the endpoint as a socket address if it is a literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::V4(addr) => Some(SocketAddr::V4(*addr)),
            Self::V6(addr) => Some(SocketAddr::V6(*addr)),
            Self::Named { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::V4(addr) => addr.port(),
            Self::V6(addr) => addr.port(),
            Self::Named { port, .. } => *port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => Self::V4(addr),
            SocketAddr::V6(addr) => Self::V6(addr),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointFromStrErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(EndpointFromStrErr::Empty);
        }
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(addr.into());
        }

        let (host, port) = s.rsplit_once(':').ok_or(EndpointFromStrErr::MissingPort)?;
        if host.is_empty() {
            return Err(EndpointFromStrErr::Empty);
        }
        let port = port.parse().map_err(|_| EndpointFromStrErr::InvalidPort)?;
        Ok(Endpoint::Named {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr) => fmt::Display::fmt(addr, f),
            Self::V6(addr) => fmt::Display::fmt(addr, f),
            Self::Named { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl fmt::Display for EndpointFromStrErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPort => f.write_str("missing port"),
            Self::InvalidPort => f.write_str("invalid port"),
            Self::Empty => f.write_str("empty endpoint"),
        }
    }
}

impl std::error::Error for EndpointFromStrErr {}

/// Generate a random keypair
pub fn keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}
