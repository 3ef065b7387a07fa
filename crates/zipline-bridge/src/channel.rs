//! # Call channel
//!
//! The minimal transport between host and guest. One side's outbound channel
//! is the other side's inbound channel. Requests and responses are single
//! opaque JSON strings; the channel never interprets them.

use std::sync::{Arc, OnceLock};

use crate::codec::ResultEnvelope;
use crate::exception::{CLOSED_EXCEPTION, ZiplineException};

/// Every name the bridge generates for itself starts with this prefix.
pub const ZIPLINE_INTERNAL_PREFIX: &str = "zipline/";
pub const HOST_PASS_BY_REFERENCE_PREFIX: &str = "zipline/host-";
pub const GUEST_PASS_BY_REFERENCE_PREFIX: &str = "zipline/guest-";

pub trait CallChannel: Send + Sync {
    /// Names that can currently receive calls.
    fn service_names(&self) -> Vec<String>;

    /// Deliver one encoded call and return its encoded result.
    fn call(&self, encoded_call: &str) -> String;

    /// Remove a bound service. Returns whether it existed. Idempotent.
    fn disconnect(&self, name: &str) -> bool;
}

/// A channel whose target is supplied after construction.
///
/// Two endpoints that talk to each other each need the other's inbound
/// channel at construction time; this breaks the cycle.
#[derive(Default)]
pub struct DeferredChannel {
    target: OnceLock<Arc<dyn CallChannel>>,
}

impl DeferredChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a target was already set.
    pub fn connect(&self, target: Arc<dyn CallChannel>) -> bool {
        self.target.set(target).is_ok()
    }
}

impl CallChannel for DeferredChannel {
    fn service_names(&self) -> Vec<String> {
        self.target
            .get()
            .map(|target| target.service_names())
            .unwrap_or_default()
    }

    fn call(&self, encoded_call: &str) -> String {
        match self.target.get() {
            Some(target) => target.call(encoded_call),
            None => ResultEnvelope::failure(&ZiplineException::new(
                CLOSED_EXCEPTION,
                "channel is not connected",
            ))
            .to_json(),
        }
    }

    fn disconnect(&self, name: &str) -> bool {
        self.target
            .get()
            .is_some_and(|target| target.disconnect(name))
    }
}
