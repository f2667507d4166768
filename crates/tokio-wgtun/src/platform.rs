//! The packet-tunnel provider seam.
//!
//! The host platform owns the virtual interface, the UDP transports and the
//! routing/DNS surface; the adapter only talks to them through these traits.

use std::{future::Future, io, net::SocketAddr};

use bytes::Bytes;
use tokio::sync::watch;

use crate::settings::NetworkSettings;

/// IP version of a packet crossing the virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// An IP packet read from, or bound for, the virtual interface.
#[derive(Debug, Clone)]
pub struct TunPacket {
    pub data: Bytes,
    pub family: IpFamily,
}

/// Lifecycle state of a UDP transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    Waiting,
    Ready,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Whether the state is terminal for readiness purposes.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }
}

/// Batch handler installed on a ready session.
pub type ReadHandler = Box<dyn FnMut(Vec<Bytes>) + Send>;

/// Completion for a datagram write.
pub type SendCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

/// Read half of the virtual interface.
pub trait IpRecv: Send {
    /// Receives the next batch of IP packets.
    ///
    /// The returned future must be cancel-safe: the adapter drops it and
    /// re-issues the read on every loop turn. An error ends only the current
    /// batch; the read is re-armed afterwards. Implementations should stay
    /// pending rather than return errors in a tight loop once the interface
    /// is gone.
    fn recv_batch(&mut self) -> impl Future<Output = io::Result<Vec<TunPacket>>> + Send;
}

/// Write half of the virtual interface.
///
/// Writes may buffer internally; the packet slice is only borrowed for the
/// duration of the call.
pub trait IpSend: Clone + Send + Sync {
    fn send(&self, packet: &[u8], family: IpFamily);
}

/// A platform UDP transport session towards one peer endpoint.
pub trait UdpSession: Clone + Send + Sync {
    /// Observes the session lifecycle state.
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Installs the datagram read handler.
    ///
    /// The handler is invoked with batches of at most `max_datagrams`
    /// datagrams per delivery.
    fn set_read_handler(&self, max_datagrams: usize, handler: ReadHandler);

    /// Queues a datagram write; the completion runs once the write settles.
    fn send_datagram(&self, datagram: Bytes, completion: SendCompletion);

    /// Tears the session down. Idempotent.
    fn cancel(&self);
}

/// The packet-tunnel provider.
pub trait Platform: Send + 'static {
    type TunRx: IpRecv + 'static;
    type TunTx: IpSend + 'static;
    type Session: UdpSession + 'static;

    /// Hands out the packet flow of the virtual interface.
    ///
    /// Called once per tunnel start.
    fn open_tun(&mut self) -> (Self::TunRx, Self::TunTx);

    /// Opens a UDP session towards `remote`. Failures are reported through
    /// the session's state, not here.
    fn open_session(&mut self, remote: SocketAddr) -> Self::Session;

    /// Applies routing/DNS settings. The adapter bounds the wait; the future
    /// may be dropped on timeout.
    fn apply_settings(
        &mut self,
        settings: &NetworkSettings,
    ) -> impl Future<Output = io::Result<()>> + Send;
}
