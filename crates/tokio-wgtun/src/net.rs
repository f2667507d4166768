//! Stock UDP transport session over tokio sockets.
//!
//! Packet-tunnel providers normally supply their own transport; this
//! implementation backs the [`UdpSession`] seam with a plain connected UDP
//! socket for embedders that have none.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::platform::{ReadHandler, SendCompletion, SessionState, UdpSession};

/// A connected UDP session towards one peer endpoint.
#[derive(Clone)]
pub struct TokioUdpSession {
    inner: Arc<Inner>,
}

struct Inner {
    remote: SocketAddr,
    state: watch::Sender<SessionState>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    connector: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TokioUdpSession {
    /// Opens a session towards `remote`.
    ///
    /// Must be called inside a tokio runtime. The session starts in
    /// `Preparing` and settles to `Ready` or `Failed` on its own.
    pub fn connect(remote: SocketAddr) -> Self {
        let inner = Arc::new(Inner {
            remote,
            state: watch::channel(SessionState::Preparing).0,
            socket: Mutex::new(None),
            connector: Mutex::new(None),
            reader: Mutex::new(None),
        });

        let task = inner.clone();
        let connector = tokio::spawn(async move {
            match open_socket(task.remote).await {
                Ok(socket) => {
                    *task.socket.lock() = Some(Arc::new(socket));
                    settle(&task.state, SessionState::Ready);
                }
                Err(err) => {
                    warn!(remote = %task.remote, "udp session failed: {err}");
                    settle(&task.state, SessionState::Failed);
                }
            }
        });
        *inner.connector.lock() = Some(connector);

        Self { inner }
    }
}

impl UdpSession for TokioUdpSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    fn set_read_handler(&self, max_datagrams: usize, mut handler: ReadHandler) {
        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            let socket = match inner.socket.lock().clone() {
                Some(socket) => socket,
                None => {
                    debug!(remote = %inner.remote, "read handler installed on a session without a socket");
                    return;
                }
            };

            let mut buf = vec![0u8; u16::MAX as usize];
            loop {
                let n = match socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(err) => {
                        debug!(remote = %inner.remote, "udp receive failed: {err}");
                        settle(&inner.state, SessionState::Failed);
                        break;
                    }
                };

                let mut batch = Vec::new();
                batch.push(Bytes::copy_from_slice(&buf[..n]));
                while batch.len() < max_datagrams {
                    match socket.try_recv(&mut buf) {
                        Ok(n) => batch.push(Bytes::copy_from_slice(&buf[..n])),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                }
                handler(batch);
            }
        });
        *self.inner.reader.lock() = Some(reader);
    }

    fn send_datagram(&self, datagram: Bytes, completion: SendCompletion) {
        let socket = self.inner.socket.lock().clone();
        tokio::spawn(async move {
            match socket {
                Some(socket) => completion(socket.send(&datagram).await.map(|_| ())),
                None => completion(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "session is not ready",
                ))),
            }
        });
    }

    fn cancel(&self) {
        if let Some(task) = self.inner.connector.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.reader.lock().take() {
            task.abort();
        }
        *self.inner.socket.lock() = None;
        settle(&self.inner.state, SessionState::Cancelled);
    }
}

async fn open_socket(remote: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match remote {
        SocketAddr::V4(..) => Domain::IPV4,
        SocketAddr::V6(..) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;

    let local: SocketAddr = match remote {
        SocketAddr::V4(..) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(..) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    socket.bind(&local.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.connect(remote).await?;
    Ok(socket)
}

// Ready may still be cancelled; Failed and Cancelled are final.
fn settle(state: &watch::Sender<SessionState>, to: SessionState) {
    state.send_if_modified(|current| {
        let allowed = !current.is_settled()
            || (*current == SessionState::Ready && to == SessionState::Cancelled);
        if allowed && *current != to {
            *current = to;
            true
        } else {
            false
        }
    });
}
