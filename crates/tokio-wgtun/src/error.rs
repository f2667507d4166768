use std::io;

use thiserror::Error;

/// Errors surfaced by adapter lifecycle operations.
///
/// Runtime errors on the packet paths are never surfaced here; they are
/// logged and absorbed, and the WireGuard protocol retries at its own
/// cadence.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine rejected the tunnel parameters.
    #[error("engine rejected the tunnel parameters")]
    Initialization,

    /// The configuration has no peer with a usable literal endpoint.
    #[error("no peer with a usable endpoint")]
    NoPeers,

    /// The platform rejected the network settings.
    #[error("failed to install network settings")]
    NetworkSettings(#[source] io::Error),

    /// The platform did not acknowledge the network settings in time.
    #[error("network settings were not acknowledged in time")]
    NetworkSettingsTimeout,

    /// A datagram was dropped because no session existed for its
    /// destination. Logged only; never returned to callers.
    #[error("no open socket for destination")]
    NoOpenSocket,

    /// The adapter's executor has shut down.
    #[error("adapter is closed")]
    Closed,
}
