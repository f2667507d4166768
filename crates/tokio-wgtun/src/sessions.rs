use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::platform::{ReadHandler, SessionState, UdpSession};

/// Session map shared between the adapter task and the engine's send
/// callbacks. Keys are the canonical peer socket addresses.
pub(crate) type SessionMap<S> = Arc<Mutex<HashMap<SocketAddr, S>>>;

/// Per-peer UDP transport sessions of one tunnel session.
///
/// The adapter task is the only writer; the send callbacks look sessions up
/// through the shared map.
pub(crate) struct SessionTable<S: UdpSession> {
    map: SessionMap<S>,
}

impl<S: UdpSession> SessionTable<S> {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn share(&self) -> SessionMap<S> {
        self.map.clone()
    }

    /// Registers a session under its endpoint. A duplicate endpoint keeps
    /// the existing session and cancels the new one.
    pub fn insert(&self, remote: SocketAddr, session: S) {
        let mut map = self.map.lock();
        if map.contains_key(&remote) {
            drop(map);
            debug!(%remote, "duplicate session endpoint, keeping the existing session");
            session.cancel();
            return;
        }
        map.insert(remote, session);
    }

    /// Waits until every session settles or `deadline` passes.
    ///
    /// Sessions that failed, were cancelled, or are still pending at the
    /// deadline lose their slot; outbound datagrams towards them are dropped
    /// from then on.
    pub async fn await_ready(&self, deadline: Instant) {
        let pending: Vec<(SocketAddr, S)> = self
            .map
            .lock()
            .iter()
            .map(|(remote, session)| (*remote, session.clone()))
            .collect();

        for (remote, session) in pending {
            let mut state = session.state();
            let outcome = timeout_at(deadline, state.wait_for(|s| s.is_settled())).await;
            match outcome {
                Ok(Ok(state)) if *state == SessionState::Ready => continue,
                Ok(_) => warn!(%remote, "session did not become ready, dropping it"),
                Err(_) => debug!(%remote, "session still pending at deadline, abandoning it"),
            }
            self.map.lock().remove(&remote);
            session.cancel();
        }
    }

    /// Installs a read handler on every remaining session.
    pub fn install_read_handlers(
        &self,
        max_datagrams: usize,
        mut make: impl FnMut(SocketAddr) -> ReadHandler,
    ) {
        let sessions: Vec<(SocketAddr, S)> = self
            .map
            .lock()
            .iter()
            .map(|(remote, session)| (*remote, session.clone()))
            .collect();
        for (remote, session) in sessions {
            session.set_read_handler(max_datagrams, make(remote));
        }
    }

    /// Cancels every session and clears the table.
    pub fn teardown(&self) {
        let sessions: Vec<S> = self.map.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.cancel();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}
