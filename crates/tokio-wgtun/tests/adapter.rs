//! End-to-end adapter scenarios against a fake packet-tunnel provider and a
//! loopback engine that echoes host packets out as datagrams.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    slice,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time,
};

use tokio_wgtun::{
    config::{Endpoint, Interface, Peer, PublicKey, StaticSecret, TunnelConfig},
    ffi::{EngineApi, IoCallbacks, RawTunnel, TunnelParams, FAMILY_V4},
    platform::{
        IpFamily, IpRecv, IpSend, Platform, ReadHandler, SendCompletion, SessionState, TunPacket,
        UdpSession,
    },
    settings::{NetworkSettings, Profile},
    Adapter, Error,
};

// ---------------------------------------------------------------------------
// Loopback engine
//
// "Encryption" is the identity: host packets come back out of the send
// callback addressed to the configured peer, tunnel payloads are delivered
// verbatim by IP version nibble. Tests tell instances apart by peer port.
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct StubCounts {
    inits: usize,
    drops: usize,
    ticks: usize,
}

fn registry() -> &'static Mutex<HashMap<u16, StubCounts>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u16, StubCounts>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn stub_counts(port: u16) -> StubCounts {
    registry().lock().unwrap().get(&port).copied().unwrap_or_default()
}

struct StubTunnel {
    io: IoCallbacks,
    family: u32,
    addr: [u8; 16],
    port: u16,
}

unsafe extern "C" fn stub_init(params: *const TunnelParams) -> *mut RawTunnel {
    let params = &*params;
    registry()
        .lock()
        .unwrap()
        .entry(params.peer_port)
        .or_default()
        .inits += 1;
    Box::into_raw(Box::new(StubTunnel {
        io: params.io,
        family: params.peer_addr_family,
        addr: params.peer_addr,
        port: params.peer_port,
    })) as *mut RawTunnel
}

unsafe extern "C" fn stub_host_traffic(tunnel: *mut RawTunnel, packet: *const u8, len: usize) {
    let tunnel = &*(tunnel as *const StubTunnel);
    if tunnel.family == FAMILY_V4 {
        let addr = u32::from_be_bytes(tunnel.addr[..4].try_into().unwrap());
        (tunnel.io.send_udp_v4)(tunnel.io.ctx, addr, tunnel.port, packet, len);
    } else {
        (tunnel.io.send_udp_v6)(tunnel.io.ctx, tunnel.addr.as_ptr(), tunnel.port, packet, len);
    }
}

unsafe extern "C" fn stub_tunnel_traffic(tunnel: *mut RawTunnel, packet: *const u8, len: usize) {
    let tunnel = &*(tunnel as *const StubTunnel);
    let payload = slice::from_raw_parts(packet, len);
    if payload.first().map(|b| b >> 4) == Some(6) {
        (tunnel.io.deliver_v6)(tunnel.io.ctx, packet, len);
    } else {
        (tunnel.io.deliver_v4)(tunnel.io.ctx, packet, len);
    }
}

unsafe extern "C" fn stub_timer(tunnel: *mut RawTunnel) {
    let tunnel = &*(tunnel as *const StubTunnel);
    registry().lock().unwrap().entry(tunnel.port).or_default().ticks += 1;
}

unsafe extern "C" fn stub_drop(tunnel: *mut RawTunnel) {
    let tunnel = Box::from_raw(tunnel as *mut StubTunnel);
    registry().lock().unwrap().entry(tunnel.port).or_default().drops += 1;
}

fn stub_engine() -> EngineApi {
    EngineApi {
        init: stub_init,
        handle_host_traffic: stub_host_traffic,
        handle_tunnel_traffic: stub_tunnel_traffic,
        handle_timer_event: stub_timer,
        drop: stub_drop,
    }
}

// ---------------------------------------------------------------------------
// Fake platform
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TunSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl IpSend for TunSink {
    fn send(&self, packet: &[u8], _family: IpFamily) {
        self.0.lock().unwrap().push(packet.to_vec());
    }
}

struct TunSource {
    rx: mpsc::UnboundedReceiver<TunPacket>,
}

impl IpRecv for TunSource {
    async fn recv_batch(&mut self) -> io::Result<Vec<TunPacket>> {
        match self.rx.recv().await {
            Some(packet) => {
                let mut batch = vec![packet];
                while let Ok(packet) = self.rx.try_recv() {
                    batch.push(packet);
                }
                Ok(batch)
            }
            None => std::future::pending().await,
        }
    }
}

#[derive(Clone)]
struct FakeSession {
    state: Arc<watch::Sender<SessionState>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    handler: Arc<Mutex<Option<ReadHandler>>>,
    cancelled: Arc<Mutex<bool>>,
}

impl FakeSession {
    fn new(state: SessionState) -> Self {
        Self {
            state: Arc::new(watch::channel(state).0),
            sent: Arc::new(Mutex::new(Vec::new())),
            handler: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(Mutex::new(false)),
        }
    }

    fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap()
    }

    /// Simulates the peer: delivers datagrams through the read handler.
    fn fire_read(&self, datagrams: Vec<Bytes>) {
        if let Some(handler) = self.handler.lock().unwrap().as_mut() {
            handler(datagrams);
        }
    }
}

impl UdpSession for FakeSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_read_handler(&self, _max_datagrams: usize, handler: ReadHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn send_datagram(&self, datagram: Bytes, completion: SendCompletion) {
        self.sent.lock().unwrap().push(datagram);
        completion(Ok(()));
    }

    fn cancel(&self) {
        *self.cancelled.lock().unwrap() = true;
        self.state.send_replace(SessionState::Cancelled);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum SettingsMode {
    Apply,
    Hang,
}

struct FakePlatform {
    packets: Arc<Mutex<Option<mpsc::UnboundedSender<TunPacket>>>>,
    sink: TunSink,
    sessions: Arc<Mutex<HashMap<SocketAddr, FakeSession>>>,
    session_state: SessionState,
    settings: Arc<Mutex<Vec<NetworkSettings>>>,
    settings_mode: Arc<Mutex<SettingsMode>>,
}

/// Test-side view of the fake platform's shared state.
#[derive(Clone)]
struct Handles {
    packets: Arc<Mutex<Option<mpsc::UnboundedSender<TunPacket>>>>,
    sink: TunSink,
    sessions: Arc<Mutex<HashMap<SocketAddr, FakeSession>>>,
    settings: Arc<Mutex<Vec<NetworkSettings>>>,
    settings_mode: Arc<Mutex<SettingsMode>>,
}

impl FakePlatform {
    fn new() -> (Self, Handles) {
        Self::with_session_state(SessionState::Ready)
    }

    fn with_session_state(session_state: SessionState) -> (Self, Handles) {
        let platform = Self {
            packets: Arc::new(Mutex::new(None)),
            sink: TunSink::default(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            session_state,
            settings: Arc::new(Mutex::new(Vec::new())),
            settings_mode: Arc::new(Mutex::new(SettingsMode::Apply)),
        };
        let handles = Handles {
            packets: platform.packets.clone(),
            sink: platform.sink.clone(),
            sessions: platform.sessions.clone(),
            settings: platform.settings.clone(),
            settings_mode: platform.settings_mode.clone(),
        };
        (platform, handles)
    }
}

impl Platform for FakePlatform {
    type TunRx = TunSource;
    type TunTx = TunSink;
    type Session = FakeSession;

    fn open_tun(&mut self) -> (TunSource, TunSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.packets.lock().unwrap() = Some(tx);
        (TunSource { rx }, self.sink.clone())
    }

    fn open_session(&mut self, remote: SocketAddr) -> FakeSession {
        let session = FakeSession::new(self.session_state);
        self.sessions.lock().unwrap().insert(remote, session.clone());
        session
    }

    async fn apply_settings(&mut self, settings: &NetworkSettings) -> io::Result<()> {
        self.settings.lock().unwrap().push(settings.clone());
        let mode = *self.settings_mode.lock().unwrap();
        match mode {
            SettingsMode::Apply => Ok(()),
            SettingsMode::Hang => std::future::pending().await,
        }
    }
}

impl Handles {
    fn inject(&self, packet: &[u8], family: IpFamily) {
        if let Some(tx) = self.packets.lock().unwrap().as_ref() {
            let _ = tx.send(TunPacket {
                data: Bytes::copy_from_slice(packet),
                family,
            });
        }
    }

    fn session(&self, remote: &str) -> FakeSession {
        let remote: SocketAddr = remote.parse().unwrap();
        self.sessions.lock().unwrap().get(&remote).unwrap().clone()
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn delivered(&self) -> Vec<Vec<u8>> {
        self.sink.0.lock().unwrap().clone()
    }

    fn last_settings(&self) -> NetworkSettings {
        self.settings.lock().unwrap().last().unwrap().clone()
    }

    fn settings_count(&self) -> usize {
        self.settings.lock().unwrap().len()
    }

    fn hang_settings(&self) {
        *self.settings_mode.lock().unwrap() = SettingsMode::Hang;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn base_config(port: u16) -> TunnelConfig {
    TunnelConfig {
        interface: Interface {
            private_key: StaticSecret::from([2u8; 32]),
            addresses: vec!["10.64.0.2/32".parse().unwrap()],
            dns_servers: Vec::new(),
            search_domains: Vec::new(),
            mtu: Some(0),
        },
        peers: vec![Peer {
            public_key: PublicKey::from([1u8; 32]),
            preshared_key: None,
            endpoint: Some(format!("10.0.0.1:{port}").parse().unwrap()),
            allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
            persistent_keepalive: None,
        }],
    }
}

fn v4_packet(len: usize) -> Vec<u8> {
    let mut packet: Vec<u8> = (0..len).map(|i| i as u8).collect();
    packet[0] = 0x45;
    packet
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_stop_cycle() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    adapter.start(base_config(51821)).await.unwrap();
    assert_eq!(handles.session_count(), 1);
    assert!(!handles.session("10.0.0.1:51821").is_cancelled());
    assert_eq!(handles.last_settings().mtu, Some(1280));

    adapter.stop().await;
    adapter.stop().await;

    assert_eq!(stub_counts(51821).inits, 1);
    assert_eq!(stub_counts(51821).drops, 1);
    assert!(handles.session("10.0.0.1:51821").is_cancelled());

    adapter.close();
    adapter.closed().await;
    assert!(adapter.is_closed());
    assert!(matches!(
        adapter.start(base_config(51821)).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn start_without_endpoint_fails_with_no_peers() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    let mut config = base_config(51829);
    config.peers[0].endpoint = None;

    assert!(matches!(adapter.start(config).await, Err(Error::NoPeers)));
    assert_eq!(adapter.stats(), (0, 0));
    assert_eq!(stub_counts(51829).inits, 0);
    assert_eq!(handles.session_count(), 0);
    assert_eq!(handles.settings_count(), 0);
}

#[tokio::test]
async fn update_resets_counters() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);
    let config = base_config(51822);

    adapter.start(config.clone()).await.unwrap();

    handles.inject(&v4_packet(100), IpFamily::V4);
    eventually(|| adapter.stats().1 == 100).await;
    let session = handles.session("10.0.0.1:51822");
    session.fire_read(vec![Bytes::copy_from_slice(&v4_packet(60))]);
    eventually(|| adapter.stats().0 == 60).await;

    adapter.update(config).await.unwrap();
    assert_eq!(adapter.stats(), (0, 0));
    assert_eq!(stub_counts(51822).inits, 2);
    assert_eq!(stub_counts(51822).drops, 1);
}

#[tokio::test(start_paused = true)]
async fn settings_timeout_aborts_start() {
    let (platform, handles) = FakePlatform::new();
    handles.hang_settings();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    assert!(matches!(
        adapter.start(base_config(51823)).await,
        Err(Error::NetworkSettingsTimeout)
    ));

    assert_eq!(stub_counts(51823).inits, 1);
    assert_eq!(stub_counts(51823).drops, 1);
    assert!(handles.session("10.0.0.1:51823").is_cancelled());

    // The timer was cancelled along with everything else.
    let ticks = stub_counts(51823).ticks;
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stub_counts(51823).ticks, ticks);
}

#[tokio::test]
async fn v6_prefixes_are_clamped_in_installed_settings() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    let mut config = base_config(51827);
    config.interface.addresses = vec!["fd00::1/64".parse().unwrap()];
    adapter.start(config).await.unwrap();

    let settings = handles.last_settings();
    assert_eq!(settings.ipv6_addresses.len(), 1);
    assert_eq!(settings.ipv6_addresses[0].prefix_len(), 120);
}

#[tokio::test]
async fn dns_servers_install_catch_all_match_domains() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    let mut config = base_config(51828);
    config.interface.dns_servers = vec!["10.64.0.1".parse().unwrap()];
    adapter.start(config).await.unwrap();

    let dns = handles.last_settings().dns.unwrap();
    assert_eq!(dns.servers, vec!["10.64.0.1".parse::<std::net::IpAddr>().unwrap()]);
    assert_eq!(dns.match_domains, Some(vec![String::new()]));
}

// ---------------------------------------------------------------------------
// Data path and invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loopback_round_trip_is_byte_identical() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);
    adapter.start(base_config(51824)).await.unwrap();

    let packet = v4_packet(100);
    handles.inject(&packet, IpFamily::V4);

    let session = handles.session("10.0.0.1:51824");
    eventually(|| !session.sent().is_empty()).await;
    let datagram = session.sent()[0].clone();
    assert_eq!(&datagram[..], &packet[..]);

    session.fire_read(vec![datagram]);
    eventually(|| !handles.delivered().is_empty()).await;
    assert_eq!(handles.delivered()[0], packet);
    assert_eq!(adapter.stats(), (100, 100));

    // Counters only ever grow while the tunnel is up.
    handles.inject(&v4_packet(40), IpFamily::V4);
    eventually(|| adapter.stats().1 == 140).await;
    assert_eq!(adapter.stats().0, 100);
}

#[tokio::test]
async fn v6_peers_get_sessions_and_traffic() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    let mut config = base_config(51831);
    config.peers[0].endpoint = Some("[fd00::aa]:51831".parse().unwrap());
    adapter.start(config).await.unwrap();

    let session = handles.session("[fd00::aa]:51831");
    let mut packet = v4_packet(80);
    packet[0] = 0x60;
    handles.inject(&packet, IpFamily::V6);

    eventually(|| !session.sent().is_empty()).await;
    assert_eq!(&session.sent()[0][..], &packet[..]);

    session.fire_read(vec![Bytes::copy_from_slice(&packet)]);
    eventually(|| !handles.delivered().is_empty()).await;
    assert_eq!(handles.delivered()[0], packet);
}

#[tokio::test]
async fn named_endpoints_do_not_create_sessions() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    let mut config = base_config(51832);
    config.peers.push(Peer {
        public_key: PublicKey::from([3u8; 32]),
        preshared_key: None,
        endpoint: Some(Endpoint::Named {
            host: "relay.example.net".to_owned(),
            port: 51820,
        }),
        allowed_ips: vec!["10.0.0.0/8".parse().unwrap()],
        persistent_keepalive: None,
    });

    adapter.start(config).await.unwrap();
    assert_eq!(handles.session_count(), 1);
}

#[tokio::test]
async fn failed_sessions_drop_outbound_traffic() {
    let (platform, handles) = FakePlatform::with_session_state(SessionState::Failed);
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    adapter.start(base_config(51834)).await.unwrap();
    assert!(handles.session("10.0.0.1:51834").is_cancelled());

    handles.inject(&v4_packet(100), IpFamily::V4);
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.stats().1, 0);
    assert!(handles.session("10.0.0.1:51834").sent().is_empty());
}

#[tokio::test]
async fn no_callbacks_after_stop() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);
    adapter.start(base_config(51826)).await.unwrap();
    let session = handles.session("10.0.0.1:51826");

    adapter.stop().await;
    let stats = adapter.stats();

    // Poke both directions and watch nothing move for a grace period.
    session.fire_read(vec![Bytes::copy_from_slice(&v4_packet(50))]);
    handles.inject(&v4_packet(50), IpFamily::V4);
    time::sleep(Duration::from_millis(200)).await;

    assert!(handles.delivered().is_empty());
    assert!(session.sent().is_empty());
    assert_eq!(adapter.stats(), stats);
}

#[tokio::test(start_paused = true)]
async fn timer_drives_engine_ticks() {
    let (platform, _handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);
    adapter.start(base_config(51825)).await.unwrap();

    time::sleep(Duration::from_millis(1100)).await;
    assert!(stub_counts(51825).ticks >= 2);

    adapter.stop().await;
    let ticks = stub_counts(51825).ticks;
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stub_counts(51825).ticks, ticks);
}

#[tokio::test]
async fn block_installs_settings_without_engine() {
    let (platform, handles) = FakePlatform::new();
    let adapter = Adapter::new(platform, stub_engine(), Profile::Mobile);

    adapter.block(base_config(51833)).await.unwrap();

    assert_eq!(handles.settings_count(), 1);
    assert_eq!(handles.last_settings().mtu, Some(1280));
    assert_eq!(stub_counts(51833).inits, 0);
    assert_eq!(handles.session_count(), 0);
}
