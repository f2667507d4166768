use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::raw::c_void,
    slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    engine::EngineHandle,
    error::Error,
    ffi::{EngineApi, IoCallbacks, TunnelParams},
    platform::{IpFamily, IpSend, Platform, UdpSession},
    sessions::SessionMap,
};

/// Traffic counters of one tunnel session.
///
/// rx counts decrypted bytes delivered to the virtual interface, tx counts
/// on-wire bytes confirmed written to a peer. Written only from the adapter
/// task (and the write completions it spawns); read from anywhere.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> (u64, u64) {
        (self.rx.load(Ordering::Relaxed), self.tx.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.rx.store(0, Ordering::Relaxed);
        self.tx.store(0, Ordering::Relaxed);
    }

    fn add_rx(&self, n: u64) {
        self.rx.fetch_add(n, Ordering::Relaxed);
    }

    fn add_tx(&self, n: u64) {
        self.tx.fetch_add(n, Ordering::Relaxed);
    }
}

/// Callback target of the engine.
///
/// Holds exactly what the callbacks touch, disjoint from the engine handle
/// itself so a callback firing inside an engine call never aliases the
/// handle. The `ctx` pointer handed to the engine is the address of the
/// `Arc` payload; [`EngineOwner`] keeps that `Arc` alive until after the
/// engine is dropped.
pub(crate) struct IoBridge<P: Platform> {
    sessions: SessionMap<P::Session>,
    tun: P::TunTx,
    counters: Arc<Counters>,
}

impl<P: Platform> IoBridge<P> {
    pub fn new(
        sessions: SessionMap<P::Session>,
        tun: P::TunTx,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            tun,
            counters,
        })
    }

    pub fn callbacks(self: &Arc<Self>) -> IoCallbacks {
        IoCallbacks {
            ctx: Arc::as_ptr(self) as *const c_void,
            send_udp_v4: send_udp_v4::<P>,
            send_udp_v6: send_udp_v6::<P>,
            deliver_v4: deliver_v4::<P>,
            deliver_v6: deliver_v6::<P>,
        }
    }

    fn send_to(&self, remote: SocketAddr, datagram: Bytes) -> i32 {
        let session = {
            let map = self.sessions.lock();
            match map.get(&remote) {
                Some(session) => session.clone(),
                // No session for this destination: drop and let the
                // handshake timers retry.
                None => {
                    trace!(%remote, "{}", Error::NoOpenSocket);
                    return -1;
                }
            }
        };

        let counters = self.counters.clone();
        let len = datagram.len() as u64;
        session.send_datagram(
            datagram,
            Box::new(move |result| match result {
                Ok(()) => counters.add_tx(len),
                Err(err) => debug!(%remote, "datagram write failed: {err}"),
            }),
        );
        0
    }

    fn deliver(&self, packet: &[u8], family: IpFamily) {
        self.tun.send(packet, family);
        self.counters.add_rx(packet.len() as u64);
    }
}

unsafe fn borrowed<'a>(buf: *const u8, len: usize) -> Option<&'a [u8]> {
    if buf.is_null() {
        return None;
    }
    Some(slice::from_raw_parts(buf, len))
}

unsafe extern "C" fn send_udp_v4<P: Platform>(
    ctx: *const c_void,
    addr: u32,
    port: u16,
    buf: *const u8,
    len: usize,
) -> i32 {
    let bridge = &*(ctx as *const IoBridge<P>);
    let Some(datagram) = borrowed(buf, len) else {
        return -1;
    };
    let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port);
    bridge.send_to(remote, Bytes::copy_from_slice(datagram))
}

unsafe extern "C" fn send_udp_v6<P: Platform>(
    ctx: *const c_void,
    addr: *const u8,
    port: u16,
    buf: *const u8,
    len: usize,
) -> i32 {
    let bridge = &*(ctx as *const IoBridge<P>);
    let (Some(datagram), Some(addr)) = (borrowed(buf, len), borrowed(addr, 16)) else {
        return -1;
    };
    let mut octets = [0u8; 16];
    octets.copy_from_slice(addr);
    let remote = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port);
    bridge.send_to(remote, Bytes::copy_from_slice(datagram))
}

unsafe extern "C" fn deliver_v4<P: Platform>(ctx: *const c_void, buf: *const u8, len: usize) {
    let bridge = &*(ctx as *const IoBridge<P>);
    if let Some(packet) = borrowed(buf, len) {
        bridge.deliver(packet, IpFamily::V4);
    }
}

unsafe extern "C" fn deliver_v6<P: Platform>(ctx: *const c_void, buf: *const u8, len: usize) {
    let bridge = &*(ctx as *const IoBridge<P>);
    if let Some(packet) = borrowed(buf, len) {
        bridge.deliver(packet, IpFamily::V6);
    }
}

/// The engine together with its callback target.
///
/// Field order is load-bearing: the engine drops before the bridge `Arc` is
/// released, so no callback can ever observe a dangling `ctx`.
pub(crate) struct EngineOwner<P: Platform> {
    engine: EngineHandle,
    _bridge: Arc<IoBridge<P>>,
}

impl<P: Platform> EngineOwner<P> {
    pub fn init(
        api: EngineApi,
        private_key: [u8; 32],
        peer_key: [u8; 32],
        peer_endpoint: SocketAddr,
        bridge: Arc<IoBridge<P>>,
    ) -> Result<Self, Error> {
        let params = TunnelParams::new(private_key, peer_key, peer_endpoint, bridge.callbacks());
        let engine = EngineHandle::init(api, &params)?;
        Ok(Self {
            engine,
            _bridge: bridge,
        })
    }

    pub fn feed_host(&mut self, packet: &[u8]) {
        self.engine.feed_host(packet);
    }

    pub fn feed_tunnel(&mut self, packet: &[u8]) {
        self.engine.feed_tunnel(packet);
    }

    pub fn tick(&mut self) {
        self.engine.tick();
    }
}
