use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::{
    sync::{futures::Notified, mpsc, oneshot, Notify},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    bridge::{Counters, EngineOwner, IoBridge},
    config::TunnelConfig,
    error::Error,
    ffi::EngineApi,
    platform::{IpRecv, Platform, TunPacket},
    sessions::SessionTable,
    settings::{network_settings, Profile},
};

const TICK_DELAY: Duration = Duration::from_millis(10);
const TICK_INTERVAL: Duration = Duration::from_millis(500);
const READINESS_TIMEOUT: Duration = Duration::from_secs(5);
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAMS: usize = 1024;

/// Handle to a tunnel adapter.
///
/// All lifecycle operations are hopped onto a single executor task that owns
/// the engine, the session table and the timer; awaiting an operation means
/// it has been fully serialized with every other mutation. The handle itself
/// is cheap to clone and may live on any thread.
///
/// Must be created inside a tokio runtime.
pub struct Adapter {
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    shared: Arc<Shared>,
    _drop: Arc<CloseOnDrop>,
}

struct Shared {
    is_closed: AtomicBool,
    notify_closed: Notify,
}

enum Command {
    Start(TunnelConfig, oneshot::Sender<Result<(), Error>>),
    Stop(oneshot::Sender<()>),
    Update(TunnelConfig, oneshot::Sender<Result<(), Error>>),
    Block(TunnelConfig, oneshot::Sender<Result<(), Error>>),
    UdpBatch(Vec<Bytes>),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Starting,
    Running,
    Stopping,
    Blocked,
}

pin_project! {
    /// Resolves once the adapter's executor has shut down.
    pub struct Closed<'a> {
        #[pin]
        notified: Notified<'a>,
        shared: Arc<Shared>,
    }
}

impl Adapter {
    /// Spawns the executor task and returns a handle to it.
    pub fn new<P: Platform>(platform: P, api: EngineApi, profile: Profile) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let shared = Arc::new(Shared {
            is_closed: AtomicBool::new(false),
            notify_closed: Notify::new(),
        });

        let core = Core {
            platform,
            api,
            profile,
            counters: counters.clone(),
            commands: commands.clone(),
            state: State::Idle,
            engine: None,
            sessions: None,
            tun_rx: None,
            timer: None,
        };
        tokio::spawn(run(core, rx, NotifyOnDrop(shared.clone())));

        Self {
            commands: commands.clone(),
            counters,
            shared,
            _drop: Arc::new(CloseOnDrop { commands }),
        }
    }

    /// Brings the tunnel up. On failure the adapter is back in the idle
    /// state with everything released.
    pub async fn start(&self, config: TunnelConfig) -> Result<(), Error> {
        self.request(|reply| Command::Start(config, reply)).await
    }

    /// Tears the tunnel down and brings it back up with `config`, resetting
    /// the traffic counters.
    pub async fn update(&self, config: TunnelConfig) -> Result<(), Error> {
        self.request(|reply| Command::Update(config, reply)).await
    }

    /// Installs routing/DNS settings without running an engine, so traffic
    /// is held instead of forwarded.
    pub async fn block(&self, config: TunnelConfig) -> Result<(), Error> {
        self.request(|reply| Command::Block(config, reply)).await
    }

    /// Tears the tunnel down. Idempotent; cannot fail.
    ///
    /// Once this returns, no engine callback will ever fire again.
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Stop(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Snapshot of (bytes received, bytes sent). Wait-free; any thread.
    pub fn stats(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    /// Best-effort name of the utun device backing the virtual interface.
    pub fn interface_name(&self) -> Option<String> {
        crate::ifname::interface_name()
    }

    /// Shuts the executor down. The tunnel is stopped first.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> Closed<'_> {
        Closed {
            notified: self.shared.notify_closed.notified(),
            shared: self.shared.clone(),
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), Error>>) -> Command,
    ) -> Result<(), Error> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::Closed)?;
        result.await.map_err(|_| Error::Closed)?
    }
}

impl Clone for Adapter {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            counters: self.counters.clone(),
            shared: self.shared.clone(),
            _drop: self._drop.clone(),
        }
    }
}

impl<'a> Future for Closed<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.is_closed.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            self.project().notified.poll(cx)
        }
    }
}

struct CloseOnDrop {
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

struct NotifyOnDrop(Arc<Shared>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.is_closed.store(true, Ordering::Release);
        self.0.notify_closed.notify_waiters();
    }
}

/// Everything the executor task owns. No other code mutates any of it.
struct Core<P: Platform> {
    platform: P,
    api: EngineApi,
    profile: Profile,
    counters: Arc<Counters>,
    commands: mpsc::UnboundedSender<Command>,
    state: State,
    engine: Option<EngineOwner<P>>,
    sessions: Option<SessionTable<P::Session>>,
    tun_rx: Option<P::TunRx>,
    timer: Option<time::Interval>,
}

async fn run<P: Platform>(
    mut core: Core<P>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    _shared: NotifyOnDrop,
) {
    enum Event {
        Command(Option<Command>),
        Tick,
        TunBatch(io::Result<Vec<TunPacket>>),
    }

    loop {
        let event = tokio::select! {
            biased;
            command = rx.recv() => Event::Command(command),
            _ = tick(&mut core.timer) => Event::Tick,
            batch = next_batch(&mut core.tun_rx) => Event::TunBatch(batch),
        };

        match event {
            Event::Command(Some(Command::Start(config, reply))) => {
                let _ = reply.send(core.start(config).await);
            }
            Event::Command(Some(Command::Stop(reply))) => {
                core.stop();
                let _ = reply.send(());
            }
            Event::Command(Some(Command::Update(config, reply))) => {
                let _ = reply.send(core.update(config).await);
            }
            Event::Command(Some(Command::Block(config, reply))) => {
                let _ = reply.send(core.block(config).await);
            }
            Event::Command(Some(Command::UdpBatch(datagrams))) => core.feed_tunnel(datagrams),
            Event::Command(Some(Command::Close)) | Event::Command(None) => break,
            Event::Tick => core.tick(),
            Event::TunBatch(batch) => core.feed_host(batch),
        }
    }

    core.stop();
}

async fn tick(timer: &mut Option<time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_batch<R: IpRecv>(tun: &mut Option<R>) -> io::Result<Vec<TunPacket>> {
    match tun {
        Some(tun) => tun.recv_batch().await,
        None => std::future::pending().await,
    }
}

impl<P: Platform> Core<P> {
    async fn start(&mut self, config: TunnelConfig) -> Result<(), Error> {
        self.stop();
        self.state = State::Starting;
        match self.start_inner(config).await {
            Ok(()) => {
                self.state = State::Running;
                Ok(())
            }
            Err(err) => {
                // Every acquisition is undone on the failure path too.
                self.stop();
                Err(err)
            }
        }
    }

    async fn start_inner(&mut self, config: TunnelConfig) -> Result<(), Error> {
        self.counters.reset();

        let mut timer = time::interval_at(Instant::now() + TICK_DELAY, TICK_INTERVAL);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);

        let (peer_key, peer_endpoint) = match config.active_peer() {
            Some((peer, endpoint)) => (peer.public_key.to_bytes(), endpoint),
            None => return Err(Error::NoPeers),
        };

        let (tun_rx, tun_tx) = self.platform.open_tun();
        let table = SessionTable::new();
        let bridge = IoBridge::<P>::new(table.share(), tun_tx, self.counters.clone());
        self.engine = Some(EngineOwner::init(
            self.api,
            config.interface.private_key.to_bytes(),
            peer_key,
            peer_endpoint,
            bridge,
        )?);
        // The first batch read is issued as soon as the loop turns.
        self.tun_rx = Some(tun_rx);

        for peer in &config.peers {
            let Some(endpoint) = peer.endpoint.as_ref() else {
                continue;
            };
            match endpoint.socket_addr() {
                Some(remote) => table.insert(remote, self.platform.open_session(remote)),
                None => warn!(%endpoint, "peer endpoint is not a literal address, skipping it"),
            }
        }
        table
            .await_ready(Instant::now() + READINESS_TIMEOUT)
            .await;

        let commands = self.commands.clone();
        table.install_read_handlers(MAX_DATAGRAMS, move |_remote| {
            let commands = commands.clone();
            Box::new(move |datagrams| {
                let _ = commands.send(Command::UdpBatch(datagrams));
            })
        });
        self.sessions = Some(table);

        self.apply_settings(&config).await
    }

    async fn apply_settings(&mut self, config: &TunnelConfig) -> Result<(), Error> {
        let settings = network_settings(config, self.profile);
        match time::timeout(SETTINGS_TIMEOUT, self.platform.apply_settings(&settings)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::NetworkSettings(err)),
            Err(_) => Err(Error::NetworkSettingsTimeout),
        }
    }

    fn stop(&mut self) {
        if self.state == State::Idle {
            return;
        }
        self.state = State::Stopping;
        // Release order is the safety story: the timer goes first so no tick
        // races the engine drop, the engine goes before its callback target,
        // and the sessions last.
        self.timer = None;
        self.engine = None;
        if let Some(sessions) = self.sessions.take() {
            sessions.teardown();
        }
        self.tun_rx = None;
        self.state = State::Idle;
    }

    async fn update(&mut self, config: TunnelConfig) -> Result<(), Error> {
        self.stop();
        self.counters.reset();
        self.start(config).await
    }

    async fn block(&mut self, config: TunnelConfig) -> Result<(), Error> {
        self.stop();
        self.apply_settings(&config).await?;
        self.state = State::Blocked;
        Ok(())
    }

    fn tick(&mut self) {
        if let Some(engine) = &mut self.engine {
            engine.tick();
        }
    }

    fn feed_host(&mut self, batch: io::Result<Vec<TunPacket>>) {
        let packets = match batch {
            Ok(packets) => packets,
            Err(err) => {
                // Only this batch is lost; the read re-arms on the next turn.
                debug!("virtual interface read failed: {err}");
                return;
            }
        };
        let Some(engine) = &mut self.engine else {
            return;
        };
        for packet in packets {
            engine.feed_host(&packet.data);
        }
    }

    fn feed_tunnel(&mut self, datagrams: Vec<Bytes>) {
        let Some(engine) = &mut self.engine else {
            return;
        };
        for datagram in datagrams {
            engine.feed_tunnel(&datagram);
        }
    }
}
