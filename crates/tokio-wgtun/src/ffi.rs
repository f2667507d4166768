//! C ABI of the opaque WireGuard engine.
//!
//! The engine is consumed as a table of entry points ([`EngineApi`]) supplied
//! by the embedder from its own bindings. This module only fixes the shapes
//! that cross the boundary; it never links against the engine itself.

use std::{
    net::SocketAddr,
    os::raw::c_void,
};

/// Address family tag for IPv4 peer endpoints (Darwin numbering).
pub const FAMILY_V4: u32 = 2;
/// Address family tag for IPv6 peer endpoints (Darwin numbering).
pub const FAMILY_V6: u32 = 30;

/// Opaque engine instance. Only ever handled through a pointer.
#[repr(C)]
pub struct RawTunnel {
    _opaque: [u8; 0],
}

/// Outbound encrypted datagram towards an IPv4 peer.
///
/// `addr` is the peer address as a host-order 32-bit value. The buffer is
/// borrowed for the duration of the call.
pub type SendUdpV4 =
    unsafe extern "C" fn(ctx: *const c_void, addr: u32, port: u16, buf: *const u8, len: usize)
        -> i32;

/// Outbound encrypted datagram towards an IPv6 peer.
///
/// `addr` points at exactly 16 bytes. The buffer is borrowed for the
/// duration of the call.
pub type SendUdpV6 = unsafe extern "C" fn(
    ctx: *const c_void,
    addr: *const u8,
    port: u16,
    buf: *const u8,
    len: usize,
) -> i32;

/// Decrypted IPv4 packet bound for the virtual interface.
pub type DeliverV4 = unsafe extern "C" fn(ctx: *const c_void, buf: *const u8, len: usize);

/// Decrypted IPv6 packet bound for the virtual interface.
pub type DeliverV6 = unsafe extern "C" fn(ctx: *const c_void, buf: *const u8, len: usize);

/// Callback context handed to the engine at init.
///
/// `ctx` is a non-owning pointer; whoever installs it must guarantee the
/// pointee outlives every engine call that can fire a callback.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoCallbacks {
    pub ctx: *const c_void,
    pub send_udp_v4: SendUdpV4,
    pub send_udp_v6: SendUdpV6,
    pub deliver_v4: DeliverV4,
    pub deliver_v6: DeliverV6,
}

/// Parameter block for engine initialization.
#[repr(C)]
pub struct TunnelParams {
    pub private_key: [u8; 32],
    pub peer_key: [u8; 32],
    pub peer_addr_family: u32,
    /// Peer address bytes; the first 4 are used for IPv4, all 16 for IPv6.
    pub peer_addr: [u8; 16],
    pub peer_port: u16,
    pub io: IoCallbacks,
}

impl TunnelParams {
    pub fn new(
        private_key: [u8; 32],
        peer_key: [u8; 32],
        endpoint: SocketAddr,
        io: IoCallbacks,
    ) -> Self {
        let mut peer_addr = [0u8; 16];
        let peer_addr_family = match endpoint {
            SocketAddr::V4(v4) => {
                peer_addr[..4].copy_from_slice(&v4.ip().octets());
                FAMILY_V4
            }
            SocketAddr::V6(v6) => {
                peer_addr.copy_from_slice(&v6.ip().octets());
                FAMILY_V6
            }
        };

        Self {
            private_key,
            peer_key,
            peer_addr_family,
            peer_addr,
            peer_port: endpoint.port(),
            io,
        }
    }
}

/// Entry points of the engine.
///
/// All mutating entry points must be serialized by the caller; the engine is
/// not internally synchronized. Callbacks fire on the calling thread before
/// the entry point returns.
#[derive(Clone, Copy)]
pub struct EngineApi {
    pub init: unsafe extern "C" fn(params: *const TunnelParams) -> *mut RawTunnel,
    pub handle_host_traffic:
        unsafe extern "C" fn(tunnel: *mut RawTunnel, packet: *const u8, len: usize),
    pub handle_tunnel_traffic:
        unsafe extern "C" fn(tunnel: *mut RawTunnel, packet: *const u8, len: usize),
    pub handle_timer_event: unsafe extern "C" fn(tunnel: *mut RawTunnel),
    pub drop: unsafe extern "C" fn(tunnel: *mut RawTunnel),
}
