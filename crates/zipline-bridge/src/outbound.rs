use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::endpoint::Endpoint;
use crate::error::{BridgeError, Result};
use crate::exception::ZiplineException;
use crate::function::{CLOSE_SIGNATURE, ZiplineFunction};
use crate::service::{ServiceFuture, ZiplineService};
use crate::value::Value;

/// A stub for a service bound on the other side of the bridge.
///
/// Cloning shares the stub. Close it when done: a stub that is dropped
/// without being closed is reported as leaked.
#[derive(Clone)]
pub struct OutboundService {
    inner: Arc<OutboundInner>,
}

pub(crate) struct OutboundInner {
    name: String,
    type_name: String,
    endpoint: Arc<Endpoint>,
    functions: HashMap<String, Arc<ZiplineFunction>>,
    closed: AtomicBool,
    internal: bool,
}

impl OutboundService {
    pub(crate) fn new(
        name: String,
        type_name: String,
        endpoint: Arc<Endpoint>,
        functions: Vec<Arc<ZiplineFunction>>,
        internal: bool,
    ) -> Self {
        let functions = functions
            .into_iter()
            .map(|f| (f.signature().to_string(), f))
            .collect();
        Self {
            inner: Arc::new(OutboundInner {
                name,
                type_name,
                endpoint,
                functions,
                closed: AtomicBool::new(false),
                internal,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn downgrade(&self) -> Weak<OutboundInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn call(&self, signature: &str, args: Vec<Value>) -> Result<Value> {
        let function = self.function(signature)?;
        if function.is_suspending() {
            return Err(BridgeError::Codec(format!(
                "{signature} is suspending; use call_suspending"
            )));
        }
        self.check_open()?;
        self.inner
            .endpoint
            .call_outbound(&self.inner.name, function, args, self.inner.internal)
    }

    pub async fn call_suspending(&self, signature: &str, args: Vec<Value>) -> Result<Value> {
        let function = self.function(signature)?.clone();
        if !function.is_suspending() {
            return Err(BridgeError::Codec(format!(
                "{signature} is not suspending; use call"
            )));
        }
        self.check_open()?;
        self.inner
            .endpoint
            .call_suspending_outbound(&self.inner.name, &function, args)
            .await
    }

    /// Close the remote service. Idempotent; later calls fail with
    /// [`BridgeError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let endpoint = &self.inner.endpoint;
        endpoint.untrack(&self.downgrade());
        if endpoint.is_closed() {
            return;
        }
        let Some(close) = self.inner.functions.get(CLOSE_SIGNATURE) else {
            return;
        };
        if let Err(e) = endpoint.call_outbound(&self.inner.name, close, Vec::new(), self.inner.internal) {
            tracing::debug!(service = %self.inner.name, error = %e, "Remote close failed");
        }
    }

    fn function(&self, signature: &str) -> Result<&Arc<ZiplineFunction>> {
        self.inner.functions.get(signature).ok_or_else(|| {
            BridgeError::Codec(format!(
                "{} has no function {signature}",
                self.inner.type_name
            ))
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::Closed(format!("{} is closed", self.inner.name)));
        }
        Ok(())
    }
}

impl fmt::Debug for OutboundService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundService")
            .field("name", &self.inner.name)
            .field("type_name", &self.inner.type_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A stub rebound on this side forwards to the original service, so a
/// remote service can be passed along to a third party.
impl ZiplineService for OutboundService {
    fn call(&self, function: &ZiplineFunction, args: Vec<Value>) -> Result<Value, ZiplineException> {
        OutboundService::call(self, function.signature(), args).map_err(ZiplineException::from)
    }

    fn call_suspending<'a>(
        &'a self,
        function: &'a ZiplineFunction,
        args: Vec<Value>,
    ) -> ServiceFuture<'a> {
        Box::pin(async move {
            OutboundService::call_suspending(self, function.signature(), args)
                .await
                .map_err(ZiplineException::from)
        })
    }

    fn close(&self) {
        OutboundService::close(self);
    }
}
