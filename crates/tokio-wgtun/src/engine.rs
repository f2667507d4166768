use std::ptr;

use crate::{
    error::Error,
    ffi::{EngineApi, RawTunnel, TunnelParams},
};

/// Owning handle over an engine instance.
///
/// All mutating calls go through `&mut self` and are serialized by the
/// adapter task; the engine has no synchronization of its own. Callbacks
/// installed through the init params fire synchronously inside these calls.
pub(crate) struct EngineHandle {
    api: EngineApi,
    raw: *mut RawTunnel,
}

impl EngineHandle {
    /// Initializes an engine instance, failing if the engine rejects the
    /// parameters.
    pub fn init(api: EngineApi, params: &TunnelParams) -> Result<Self, Error> {
        // Safety: params is valid for the duration of the call; the engine
        // copies what it keeps.
        let raw = unsafe { (api.init)(params) };
        if raw.is_null() {
            return Err(Error::Initialization);
        }
        Ok(Self { api, raw })
    }

    /// Feeds an outbound IP packet read from the virtual interface.
    pub fn feed_host(&mut self, packet: &[u8]) {
        // Safety: raw is non-null until drop; the buffer is borrowed for the
        // duration of the call.
        unsafe { (self.api.handle_host_traffic)(self.raw, packet.as_ptr(), packet.len()) }
    }

    /// Feeds an inbound UDP payload received from a peer.
    pub fn feed_tunnel(&mut self, packet: &[u8]) {
        // Safety: as above.
        unsafe { (self.api.handle_tunnel_traffic)(self.raw, packet.as_ptr(), packet.len()) }
    }

    /// Advances the engine timers.
    pub fn tick(&mut self) {
        // Safety: raw is non-null until drop.
        unsafe { (self.api.handle_timer_event)(self.raw) }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            // Safety: released exactly once; the pointer is nulled so a
            // second drop is impossible even through a bug elsewhere.
            unsafe { (self.api.drop)(self.raw) };
            self.raw = ptr::null_mut();
        }
    }
}

// The raw pointer moves with the adapter task; that task is the only caller
// of the mutating surface.
unsafe impl Send for EngineHandle {}
