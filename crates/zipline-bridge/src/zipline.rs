//! # Host object
//!
//! A [`Zipline`] is one running guest: its engine plus the host endpoint of
//! the bridge. Evaluation, module loads, host-to-guest calls and suspend
//! callbacks all enter one [`GuestContext`], so the engine only ever runs on
//! one thread at a time. A host service called by the guest may call guest
//! services, but may not evaluate more guest code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use crate::bundle::ZiplineFile;
use crate::channel::HOST_PASS_BY_REFERENCE_PREFIX;
use crate::codec::CodecRegistry;
use crate::context::GuestContext;
use crate::endpoint::Endpoint;
use crate::engine::{EngineError, GuestCode, GuestEngine};
use crate::error::{BridgeError, Result};
use crate::events::EventListener;
use crate::function::ServiceDescriptor;
use crate::outbound::OutboundService;
use crate::service::ZiplineService;

pub struct Zipline {
    context: GuestContext,
    /// `None` once the engine is closed.
    engine: Mutex<Option<Box<dyn GuestEngine>>>,
    endpoint: Arc<Endpoint>,
    listener: Arc<dyn EventListener>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Zipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zipline")
            .field("services", &self.service_names())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Zipline {
    pub fn create(
        mut engine: Box<dyn GuestEngine>,
        codecs: Arc<CodecRegistry>,
        listener: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        let context = GuestContext::new();
        let endpoint = Endpoint::new(
            HOST_PASS_BY_REFERENCE_PREFIX,
            codecs,
            listener.clone(),
            context.serialize(engine.inbound_channel()),
        );
        engine.set_outbound_channel(endpoint.inbound_channel());

        tracing::debug!("Zipline created");
        listener.zipline_created();
        Arc::new(Self {
            context,
            engine: Mutex::new(Some(engine)),
            endpoint,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn bind(
        &self,
        name: &str,
        service: Arc<dyn ZiplineService>,
        descriptor: &ServiceDescriptor,
    ) -> Result<()> {
        self.endpoint.bind(name, service, descriptor)
    }

    pub fn take(&self, name: &str, descriptor: &ServiceDescriptor) -> Result<OutboundService> {
        self.endpoint.take(name, descriptor)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.endpoint.service_names()
    }

    pub fn client_names(&self) -> Vec<String> {
        self.endpoint.client_names()
    }

    pub fn evaluate(&self, source: &str, file_name: &str) -> Result<serde_json::Value> {
        self.with_engine(|engine| engine.evaluate(GuestCode::Source(source), file_name))
    }

    /// Load one module from its bundle bytes.
    pub fn load_module(&self, bundle: &[u8], module_id: &str) -> Result<()> {
        let file = ZiplineFile::read(bundle)?;
        self.load(GuestCode::Bytecode(&file.bytecode), module_id)
    }

    /// Compile and load a module from source.
    pub fn load_js_module(&self, source: &str, module_id: &str) -> Result<()> {
        let bytecode = self.with_engine(|engine| engine.compile(source, module_id))?;
        self.load(GuestCode::Bytecode(&bytecode), module_id)
    }

    fn load(&self, code: GuestCode<'_>, module_id: &str) -> Result<()> {
        self.listener.module_load_start(module_id);
        let result = self.with_engine(|engine| engine.evaluate(code, module_id));
        self.listener.module_load_end(module_id);

        result?;
        tracing::debug!(module_id, "Module loaded");
        Ok(())
    }

    /// Run the application's entry point.
    ///
    /// The module id is quoted into a script, so it may not contain quotes,
    /// backslashes or control characters. The function must be an identifier.
    pub fn call_main(&self, module_id: &str, function: &str) -> Result<serde_json::Value> {
        if module_id.is_empty()
            || module_id
                .chars()
                .any(|c| matches!(c, '\'' | '"' | '\\') || c.is_control())
        {
            return Err(BridgeError::InvalidEntryPoint(format!("module id {module_id:?}")));
        }
        if !is_identifier(function) {
            return Err(BridgeError::InvalidEntryPoint(format!("function {function:?}")));
        }
        let script = format!("require('{module_id}').{function}()");
        self.evaluate(&script, "main.js")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the bridge and the engine. Idempotent.
    ///
    /// When called from a host service while guest code is running on this
    /// thread, the engine is closed as soon as that guest code returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.endpoint.close();
        {
            let _entered = self.context.enter();
            let engine = match self.engine.try_lock() {
                Ok(mut slot) => slot.take(),
                Err(TryLockError::Poisoned(e)) => e.into_inner().take(),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(mut engine) = engine {
                engine.close();
            }
        }

        tracing::debug!("Zipline closed");
        self.listener.zipline_closed();
    }

    /// Run `f` on the engine inside the guest context.
    ///
    /// Other threads wait their turn. Within the context the engine mutex is
    /// only ever held further up this thread's stack, so failing to take it
    /// means guest code is already running here.
    fn with_engine<T>(
        &self,
        f: impl FnOnce(&mut dyn GuestEngine) -> std::result::Result<T, EngineError>,
    ) -> Result<T> {
        let _entered = self.context.enter();
        let mut slot = match self.engine.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(BridgeError::Engine(EngineError::new(
                    "guest code is already running on this thread",
                )));
            }
        };
        if self.is_closed() {
            return Err(BridgeError::Closed("Zipline closed".into()));
        }
        let Some(engine) = slot.as_mut() else {
            return Err(BridgeError::Closed("Zipline closed".into()));
        };
        let result = f(&mut **engine);

        // Closed by a host service while the guest was running.
        if self.is_closed()
            && let Some(mut engine) = slot.take()
        {
            engine.close();
        }
        Ok(result?)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
