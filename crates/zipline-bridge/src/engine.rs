use std::sync::Arc;

use thiserror::Error;

use crate::channel::CallChannel;

/// Failure reported by a guest engine, typically an exception thrown by
/// guest code.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub enum GuestCode<'a> {
    Source(&'a str),
    Bytecode(&'a [u8]),
}

/// The sandboxed interpreter that runs guest code.
///
/// An engine is single-threaded. [`Zipline`](crate::Zipline) enters one
/// [`GuestContext`](crate::GuestContext) for every use of it: each method
/// here and every call through `inbound_channel`, including callbacks that
/// complete suspending calls. Implementations may therefore assume at most
/// one thread is inside the guest. Calls through `inbound_channel` may
/// arrive while `evaluate` is on the stack of the same thread, when guest
/// code calls a host service that calls back into the guest.
///
/// The engine owns the guest side of the bridge: `inbound_channel` receives
/// host calls, and `set_outbound_channel` gives guest code the way back to
/// the host.
pub trait GuestEngine: Send {
    /// Run a script or compiled module and return its completion value.
    fn evaluate(&mut self, code: GuestCode<'_>, file_name: &str) -> Result<serde_json::Value, EngineError>;

    fn compile(&mut self, source: &str, file_name: &str) -> Result<Vec<u8>, EngineError>;

    /// Channel for host-to-guest calls.
    fn inbound_channel(&self) -> Arc<dyn CallChannel>;

    /// Install the channel for guest-to-host calls. Called once, before any
    /// guest code runs.
    fn set_outbound_channel(&mut self, channel: Arc<dyn CallChannel>);

    fn close(&mut self);
}
