//! Runs the adapter against an in-process echo engine and a loopback
//! platform: every IP packet fed into the virtual interface is "encrypted"
//! (copied) out to the peer session, reflected by the fake peer, and
//! delivered back byte-identical.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_wgtun::{
    config::{self, Interface, Peer, TunnelConfig},
    ffi::{EngineApi, IoCallbacks, RawTunnel, TunnelParams},
    platform::{
        IpFamily, IpRecv, IpSend, Platform, ReadHandler, SendCompletion, SessionState, TunPacket,
        UdpSession,
    },
    settings::Profile,
    Adapter,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let (packets, sink, platform) = LoopbackPlatform::new();
    let adapter = Adapter::new(platform, echo_engine(), Profile::Desktop);

    let (private_key, _) = config::keypair();
    let (_, peer_public) = config::keypair();
    let config = TunnelConfig {
        interface: Interface {
            private_key,
            addresses: vec!["10.64.0.2/32".parse().unwrap()],
            dns_servers: vec!["10.64.0.1".parse().unwrap()],
            search_domains: Vec::new(),
            mtu: None,
        },
        peers: vec![Peer {
            public_key: peer_public,
            preshared_key: None,
            endpoint: Some("10.0.0.1:51820".parse().unwrap()),
            allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
            persistent_keepalive: Some(25),
        }],
    };

    adapter.start(config).await.expect("tunnel start");

    let packet = Bytes::from_static(&[0x45, 0, 0, 4]);
    packets.send(TunPacket {
        data: packet.clone(),
        family: IpFamily::V4,
    })
    .expect("inject packet");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (rx, tx) = adapter.stats();
    println!("rx={rx} tx={tx} delivered={:?}", sink.lock().first());
    assert_eq!(sink.lock().first().map(|p| &p[..]), Some(&packet[..]));

    adapter.stop().await;
    adapter.close();
    adapter.closed().await;
}

// An "engine" that treats encryption as the identity function.

struct EchoTunnel {
    io: IoCallbacks,
    addr: u32,
    port: u16,
}

unsafe extern "C" fn echo_init(params: *const TunnelParams) -> *mut RawTunnel {
    let params = &*params;
    Box::into_raw(Box::new(EchoTunnel {
        io: params.io,
        addr: u32::from_be_bytes(params.peer_addr[..4].try_into().unwrap()),
        port: params.peer_port,
    })) as *mut RawTunnel
}

unsafe extern "C" fn echo_host(tunnel: *mut RawTunnel, packet: *const u8, len: usize) {
    let tunnel = &*(tunnel as *const EchoTunnel);
    (tunnel.io.send_udp_v4)(tunnel.io.ctx, tunnel.addr, tunnel.port, packet, len);
}

unsafe extern "C" fn echo_tunnel(tunnel: *mut RawTunnel, packet: *const u8, len: usize) {
    let tunnel = &*(tunnel as *const EchoTunnel);
    (tunnel.io.deliver_v4)(tunnel.io.ctx, packet, len);
}

unsafe extern "C" fn echo_timer(_: *mut RawTunnel) {}

unsafe extern "C" fn echo_drop(tunnel: *mut RawTunnel) {
    drop(Box::from_raw(tunnel as *mut EchoTunnel));
}

fn echo_engine() -> EngineApi {
    EngineApi {
        init: echo_init,
        handle_host_traffic: echo_host,
        handle_tunnel_traffic: echo_tunnel,
        handle_timer_event: echo_timer,
        drop: echo_drop,
    }
}

// A platform whose peer sessions reflect every datagram straight back.

type Sink = Arc<Mutex<Vec<Vec<u8>>>>;

struct LoopbackPlatform {
    packets: mpsc::UnboundedReceiver<TunPacket>,
    sink: Sink,
    taken: bool,
}

impl LoopbackPlatform {
    fn new() -> (mpsc::UnboundedSender<TunPacket>, Sink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Sink::default();
        (
            tx,
            sink.clone(),
            Self {
                packets: rx,
                sink,
                taken: false,
            },
        )
    }
}

struct TunSource(mpsc::UnboundedReceiver<TunPacket>);

impl IpRecv for TunSource {
    async fn recv_batch(&mut self) -> io::Result<Vec<TunPacket>> {
        match self.0.recv().await {
            Some(packet) => Ok(vec![packet]),
            None => std::future::pending().await,
        }
    }
}

#[derive(Clone)]
struct TunSink(Sink);

impl IpSend for TunSink {
    fn send(&self, packet: &[u8], _family: IpFamily) {
        self.0.lock().push(packet.to_vec());
    }
}

#[derive(Clone)]
struct ReflectSession {
    state: Arc<watch::Sender<SessionState>>,
    handler: Arc<Mutex<Option<ReadHandler>>>,
}

impl UdpSession for ReflectSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_read_handler(&self, _max_datagrams: usize, handler: ReadHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn send_datagram(&self, datagram: Bytes, completion: SendCompletion) {
        // The fake peer answers with the same datagram.
        if let Some(handler) = self.handler.lock().as_mut() {
            handler(vec![datagram]);
        }
        completion(Ok(()));
    }

    fn cancel(&self) {
        self.state.send_replace(SessionState::Cancelled);
    }
}

impl Platform for LoopbackPlatform {
    type TunRx = TunSource;
    type TunTx = TunSink;
    type Session = ReflectSession;

    fn open_tun(&mut self) -> (TunSource, TunSink) {
        assert!(!self.taken, "single-start example");
        self.taken = true;
        let (_, empty) = mpsc::unbounded_channel();
        let rx = std::mem::replace(&mut self.packets, empty);
        (TunSource(rx), TunSink(self.sink.clone()))
    }

    fn open_session(&mut self, _remote: SocketAddr) -> ReflectSession {
        ReflectSession {
            state: Arc::new(watch::channel(SessionState::Ready).0),
            handler: Arc::new(Mutex::new(None)),
        }
    }

    async fn apply_settings(
        &mut self,
        settings: &tokio_wgtun::NetworkSettings,
    ) -> io::Result<()> {
        println!("settings: {settings:?}");
        Ok(())
    }
}
