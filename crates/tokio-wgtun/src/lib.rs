//! Userspace WireGuard tunnel adapter for packet-tunnel providers.
//!
//! Bridges three event sources — IP packets from the provider's virtual
//! interface, UDP datagrams from peer transport sessions, and a periodic
//! timer — into an opaque WireGuard engine, with every state mutation
//! serialized onto a single executor task. The engine itself (Noise
//! handshake, transport crypto, protocol timers) is supplied by the
//! embedder as a table of C entry points.

pub mod config;
pub mod error;
pub mod ffi;
pub mod net;
pub mod platform;
pub mod settings;

mod adapter;
mod bridge;
mod engine;
mod ifname;
mod sessions;

pub use crate::{
    adapter::{Adapter, Closed},
    config::TunnelConfig,
    error::Error,
    ffi::EngineApi,
    ifname::interface_name,
    platform::Platform,
    settings::{network_settings, NetworkSettings, Profile},
};
