//! # Guest context
//!
//! A guest engine runs on one thread at a time. Every entry into it goes
//! through a single [`GuestContext`]: evaluation, module loads, host calls
//! into guest services and the callbacks that complete suspending calls.
//!
//! The context is reentrant on the thread that holds it. While guest code
//! runs it may call a host service, and that service may call back into the
//! guest on the same thread.

use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::channel::CallChannel;

#[derive(Clone, Default)]
pub struct GuestContext {
    lock: Arc<ReentrantMutex<()>>,
}

/// Held while the current thread is inside the guest.
pub type Entered<'a> = ReentrantMutexGuard<'a, ()>;

impl GuestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other thread is inside the guest.
    pub fn enter(&self) -> Entered<'_> {
        self.lock.lock()
    }

    /// Wrap `channel` so every use of it enters this context.
    pub fn serialize(&self, channel: Arc<dyn CallChannel>) -> Arc<dyn CallChannel> {
        Arc::new(SerializedChannel {
            context: self.clone(),
            inner: channel,
        })
    }
}

struct SerializedChannel {
    context: GuestContext,
    inner: Arc<dyn CallChannel>,
}

impl CallChannel for SerializedChannel {
    fn service_names(&self) -> Vec<String> {
        let _entered = self.context.enter();
        self.inner.service_names()
    }

    fn call(&self, encoded_call: &str) -> String {
        let _entered = self.context.enter();
        self.inner.call(encoded_call)
    }

    fn disconnect(&self, name: &str) -> bool {
        let _entered = self.context.enter();
        self.inner.disconnect(name)
    }
}
