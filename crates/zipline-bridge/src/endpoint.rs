//! # Endpoint
//!
//! One side of a bridge. An endpoint owns the services bound on its side
//! (inbound), hands out stubs for services bound on the other side
//! (outbound), and keeps the bookkeeping that suspending calls and
//! pass-by-reference values need.
//!
//! Locking: all mutable state lives behind one mutex that is held only for
//! map updates. It is never held while calling a service, a channel or the
//! event listener, so a service may call back across the bridge freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::channel::CallChannel;
use crate::codec::{CallEnvelope, CodecRegistry, ResultEnvelope};
use crate::error::{BridgeError, Result};
use crate::events::{Call, CallOutcome, EventListener};
use crate::exception::ZiplineException;
use crate::function::{ServiceDescriptor, ZiplineFunction};
use crate::outbound::{OutboundInner, OutboundService};
use crate::service::{InboundService, ZiplineService};
use crate::suspend::{
    CANCEL_SIGNATURE, CancelCallback, INVOKE_SIGNATURE, SuspendCallback,
    cancel_callback_descriptor, suspend_callback_descriptor,
};
use crate::value::{Value, describe_args};

const CLOSED_MESSAGE: &str = "Zipline closed";

pub struct Endpoint {
    prefix: String,
    codecs: Arc<CodecRegistry>,
    listener: Arc<dyn EventListener>,
    outbound: Arc<dyn CallChannel>,
    runtime: Option<Handle>,
    this: Weak<Endpoint>,
    next_id: AtomicU64,
    closed: AtomicBool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    inbound: HashMap<String, Arc<InboundService>>,
    /// Outbound suspending calls waiting for their callback, by callback name.
    continuations: HashMap<String, oneshot::Sender<Result<Value>>>,
    /// Inbound suspending calls in progress, by cancel callback name.
    tasks: HashMap<String, AbortHandle>,
    /// Stubs that must be closed, for leak detection.
    stubs: Vec<TrackedStub>,
    /// Inbound calls being dispatched.
    in_flight: usize,
}

struct TrackedStub {
    name: String,
    stub: Weak<OutboundInner>,
}

impl Endpoint {
    /// `prefix` namespaces the names this endpoint generates for
    /// pass-by-reference values, e.g. `zipline/host-`.
    ///
    /// Suspending calls are spawned on the tokio runtime current at
    /// construction, or at call time if there was none.
    pub fn new(
        prefix: impl Into<String>,
        codecs: Arc<CodecRegistry>,
        listener: Arc<dyn EventListener>,
        outbound: Arc<dyn CallChannel>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            prefix: prefix.into(),
            codecs,
            listener,
            outbound,
            runtime: Handle::try_current().ok(),
            this: this.clone(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        })
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// The channel the other side uses to call into this endpoint.
    pub fn inbound_channel(&self) -> Arc<dyn CallChannel> {
        Arc::new(InboundChannel {
            endpoint: self.this.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Names of the services bound on this side.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().inbound.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the services bound on the other side.
    pub fn client_names(&self) -> Vec<String> {
        self.outbound.service_names()
    }

    pub fn bind(
        &self,
        name: &str,
        service: Arc<dyn ZiplineService>,
        descriptor: &ServiceDescriptor,
    ) -> Result<()> {
        self.check_open()?;
        let functions = self.codecs.resolve(descriptor)?;

        {
            let mut state = self.lock();
            if state.inbound.contains_key(name) {
                return Err(BridgeError::AlreadyBound(name.to_string()));
            }
            let inbound = InboundService::new(name.to_string(), service, functions, false);
            state.inbound.insert(name.to_string(), Arc::new(inbound));
        }

        tracing::info!(service = %name, type_name = %descriptor.type_name, "Service bound");
        self.listener.bind_service(name);
        Ok(())
    }

    /// Create a stub for the service `name` on the other side.
    ///
    /// Stubs taken earlier that were dropped without being closed are
    /// reported to the listener first, and their services are disconnected.
    pub fn take(&self, name: &str, descriptor: &ServiceDescriptor) -> Result<OutboundService> {
        self.check_open()?;
        let functions = self.codecs.resolve(descriptor)?;
        self.detect_leaks();

        let stub = self.new_stub(name.to_string(), descriptor, functions, false)?;
        tracing::info!(service = %name, type_name = %descriptor.type_name, "Service taken");
        self.listener.take_service(name);
        Ok(stub)
    }

    /// Remove an inbound service. Returns whether it was bound.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.lock().inbound.remove(name);
        if removed.is_some() {
            tracing::debug!(service = %name, "Service removed");
        }
        removed.is_some()
    }

    /// Close the endpoint. Pending outbound suspending calls fail with
    /// [`BridgeError::Cancelled`], inbound ones are aborted, and every later
    /// call fails with [`BridgeError::Closed`]. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (continuations, tasks, inbound) = {
            let mut state = self.lock();
            state.stubs.clear();
            (
                std::mem::take(&mut state.continuations),
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.inbound),
            )
        };

        for task in tasks.into_values() {
            task.abort();
        }
        let pending = continuations.len();
        for continuation in continuations.into_values() {
            let _ = continuation.send(Err(BridgeError::Cancelled(CLOSED_MESSAGE.into())));
        }
        drop(inbound);

        tracing::info!(prefix = %self.prefix, pending, "Endpoint closed");
    }

    pub(crate) fn bind_by_reference(
        &self,
        descriptor: &ServiceDescriptor,
        service: Arc<dyn ZiplineService>,
    ) -> Result<String> {
        self.check_open()?;
        let functions = self.codecs.resolve(descriptor)?;
        let name = self.generate_name();

        let inbound = InboundService::new(name.clone(), service, functions, false);
        self.lock().inbound.insert(name.clone(), Arc::new(inbound));

        tracing::debug!(service = %name, type_name = %descriptor.type_name, "Bound by reference");
        self.listener.bind_service(&name);
        Ok(name)
    }

    pub(crate) fn take_by_reference(
        &self,
        name: &str,
        descriptor: &ServiceDescriptor,
    ) -> Result<OutboundService> {
        let functions = self.codecs.resolve(descriptor)?;
        let stub = self.new_stub(name.to_string(), descriptor, functions, false)?;

        tracing::debug!(service = %name, type_name = %descriptor.type_name, "Taken by reference");
        self.listener.take_service(name);
        Ok(stub)
    }

    pub(crate) fn untrack(&self, stub: &Weak<OutboundInner>) {
        self.lock().stubs.retain(|tracked| !tracked.stub.ptr_eq(stub));
    }

    /// Deliver the result of an outbound suspending call.
    pub(crate) fn complete_continuation(&self, callback_name: &str, result: Result<Value>) {
        let continuation = {
            let mut state = self.lock();
            state.inbound.remove(callback_name);
            state.continuations.remove(callback_name)
        };
        if let Some(continuation) = continuation {
            let _ = continuation.send(result);
        }
    }

    fn abandon_continuation(&self, callback_name: &str) {
        let mut state = self.lock();
        state.inbound.remove(callback_name);
        state.continuations.remove(callback_name);
    }

    /// Abort an inbound suspending call.
    pub(crate) fn cancel_task(&self, cancel_name: &str) {
        if let Some(task) = self.remove_task(cancel_name) {
            tracing::debug!(callback = %cancel_name, "Suspending call cancelled");
            task.abort();
        }
    }

    fn remove_task(&self, cancel_name: &str) -> Option<AbortHandle> {
        let mut state = self.lock();
        state.inbound.remove(cancel_name);
        state.tasks.remove(cancel_name)
    }

    pub(crate) fn call_outbound(
        &self,
        service_name: &str,
        function: &ZiplineFunction,
        args: Vec<Value>,
        internal: bool,
    ) -> Result<Value> {
        self.check_open()?;
        tracing::debug!(service = %service_name, signature = %function.signature(), "Outbound call");

        let call = call_event(service_name, function, &args, internal);
        let token = call.as_ref().and_then(|call| self.listener.call_start(call));

        let result = self
            .encode_call(service_name, function, args, None)
            .and_then(|encoded| ResultEnvelope::from_json(&self.outbound.call(&encoded)))
            .and_then(ResultEnvelope::into_result)
            .and_then(|json| function.result_codec().decode(json, self));

        if let Some(call) = call {
            self.listener.call_end(&call, &outbound_outcome(&result), token);
        }
        result
    }

    pub(crate) async fn call_suspending_outbound(
        &self,
        service_name: &str,
        function: &Arc<ZiplineFunction>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.check_open()?;
        tracing::debug!(service = %service_name, signature = %function.signature(), "Outbound suspending call");

        let call = call_event(service_name, function, &args, false);
        let token = call.as_ref().and_then(|call| self.listener.call_start(call));

        let result = self.suspend(service_name, function, args).await;

        if let Some(call) = call {
            self.listener.call_end(&call, &outbound_outcome(&result), token);
        }
        result
    }

    async fn suspend(
        &self,
        service_name: &str,
        function: &Arc<ZiplineFunction>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let callback_functions = self.codecs.resolve(&suspend_callback_descriptor())?;
        let callback_name = self.generate_name();
        let (sender, receiver) = oneshot::channel();

        {
            let callback = SuspendCallback::new(self.this.clone(), callback_name.clone(), function.clone());
            let inbound =
                InboundService::new(callback_name.clone(), Arc::new(callback), callback_functions, true);
            let mut state = self.lock();
            state.continuations.insert(callback_name.clone(), sender);
            state.inbound.insert(callback_name.clone(), Arc::new(inbound));
        }
        let mut guard = SuspendGuard {
            endpoint: self,
            callback_name: callback_name.clone(),
            cancel: None,
            completed: false,
        };

        let response = self
            .encode_call(service_name, function, args, Some(callback_name))
            .and_then(|encoded| ResultEnvelope::from_json(&self.outbound.call(&encoded)))
            .and_then(ResultEnvelope::into_result)?;
        if let serde_json::Value::String(cancel_name) = response {
            let functions = self.codecs.resolve(&cancel_callback_descriptor())?;
            guard.cancel = Some(self.new_stub(cancel_name, &cancel_callback_descriptor(), functions, true)?);
        }

        let result = receiver
            .await
            .unwrap_or_else(|_| Err(BridgeError::Cancelled(CLOSED_MESSAGE.into())));
        guard.completed = true;
        result
    }

    fn encode_call(
        &self,
        service_name: &str,
        function: &ZiplineFunction,
        args: Vec<Value>,
        callback: Option<String>,
    ) -> Result<String> {
        let codecs = function.arg_codecs();
        if args.len() != codecs.len() {
            return Err(BridgeError::Codec(format!(
                "{} takes {} arguments, got {}",
                function.signature(),
                codecs.len(),
                args.len()
            )));
        }
        let args = args
            .into_iter()
            .zip(codecs)
            .map(|(arg, codec)| codec.encode(arg, self))
            .collect::<Result<Vec<_>>>()?;

        CallEnvelope {
            service: service_name.to_string(),
            function: function.id().to_string(),
            signature: function.signature().to_string(),
            args,
            callback,
        }
        .to_json()
    }

    fn dispatch(&self, encoded_call: &str) -> String {
        let _in_flight = InFlight::enter(self);
        let result = CallEnvelope::from_json(encoded_call)
            .map_err(ZiplineException::from)
            .and_then(|envelope| self.dispatch_envelope(envelope));
        match result {
            Ok(json) => ResultEnvelope::success(json).to_json(),
            Err(exception) => ResultEnvelope::failure(&exception).to_json(),
        }
    }

    fn dispatch_envelope(&self, envelope: CallEnvelope) -> Result<serde_json::Value, ZiplineException> {
        self.check_open()?;

        let inbound = self.lock().inbound.get(&envelope.service).cloned();
        let Some(inbound) = inbound else {
            return Err(no_such_service(&envelope.service, &self.service_names()).into());
        };
        let Some(function) = inbound.function(&envelope.function).cloned() else {
            return Err(no_such_method(&envelope.signature, inbound.signatures()).into());
        };

        let codecs = function.arg_codecs();
        if envelope.args.len() != codecs.len() {
            return Err(BridgeError::Codec(format!(
                "{} takes {} arguments, got {}",
                function.signature(),
                codecs.len(),
                envelope.args.len()
            ))
            .into());
        }
        let args = envelope
            .args
            .into_iter()
            .zip(codecs)
            .map(|(json, codec)| codec.decode(json, self))
            .collect::<Result<Vec<_>>>()?;

        if function.is_suspending() {
            let callback = envelope.callback.ok_or_else(|| {
                BridgeError::Codec(format!("{} called without a callback", function.signature()))
            })?;
            return Ok(self.dispatch_suspending(inbound, function, args, callback)?);
        }

        let call = call_event(&inbound.name, &function, &args, inbound.internal);
        let token = call.as_ref().and_then(|call| self.listener.call_start(call));

        let result = if function.is_close() {
            self.remove(&inbound.name);
            inbound.service.close();
            Ok(serde_json::Value::Null)
        } else {
            inbound
                .service
                .call(&function, args)
                .and_then(|value| Ok(function.result_codec().encode(value, self)?))
        };

        if let Some(call) = call {
            self.listener.call_end(&call, &inbound_outcome(&result), token);
        }
        result
    }

    /// Spawn an inbound suspending call and answer with the name of its
    /// cancel callback.
    fn dispatch_suspending(
        &self,
        inbound: Arc<InboundService>,
        function: Arc<ZiplineFunction>,
        args: Vec<Value>,
        callback_name: String,
    ) -> Result<serde_json::Value> {
        let runtime = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or(BridgeError::NoRuntime)?;
        let endpoint = self.arc()?;

        let callback_functions = self.codecs.resolve(&suspend_callback_descriptor())?;
        let callback =
            self.new_stub(callback_name, &suspend_callback_descriptor(), callback_functions, true)?;
        let cancel_functions = self.codecs.resolve(&cancel_callback_descriptor())?;
        let cancel_name = self.generate_name();

        let call = call_event(&inbound.name, &function, &args, inbound.internal);
        let task_cancel_name = cancel_name.clone();
        let task = async move {
            let token = call.as_ref().and_then(|call| endpoint.listener.call_start(call));
            let result = inbound
                .service
                .call_suspending(&function, args)
                .await
                .and_then(|value| Ok(function.result_codec().encode(value, &endpoint)?));
            if let Some(call) = call {
                endpoint.listener.call_end(&call, &inbound_outcome(&result), token);
            }

            endpoint.remove_task(&task_cancel_name);
            if endpoint.is_closed() {
                return;
            }
            let envelope = match result {
                Ok(json) => ResultEnvelope::success(json),
                Err(exception) => ResultEnvelope::failure(&exception),
            };
            if let Err(e) = callback.call(INVOKE_SIGNATURE, vec![Value::Data(envelope.to_value())]) {
                tracing::debug!(callback = %callback.name(), error = %e, "Suspend callback failed");
            }
        };

        let cancel = CancelCallback::new(self.this.clone(), cancel_name.clone());
        let cancel = InboundService::new(cancel_name.clone(), Arc::new(cancel), cancel_functions, true);
        {
            // Registered under the lock so a fast task can't finish first.
            let mut state = self.lock();
            let handle = runtime.spawn(task);
            state.tasks.insert(cancel_name.clone(), handle.abort_handle());
            state.inbound.insert(cancel_name.clone(), Arc::new(cancel));
        }
        Ok(serde_json::Value::String(cancel_name))
    }

    fn new_stub(
        &self,
        name: String,
        descriptor: &ServiceDescriptor,
        functions: Vec<Arc<ZiplineFunction>>,
        internal: bool,
    ) -> Result<OutboundService> {
        let stub = OutboundService::new(
            name.clone(),
            descriptor.type_name.clone(),
            self.arc()?,
            functions,
            internal,
        );
        if !internal {
            self.lock().stubs.push(TrackedStub {
                name,
                stub: stub.downgrade(),
            });
        }
        Ok(stub)
    }

    /// Report stubs dropped without `close()`. Skipped while a call is being
    /// dispatched on this endpoint; the check and the sweep share one lock
    /// with the dispatch counter.
    fn detect_leaks(&self) {
        let leaked: Vec<String> = {
            let mut state = self.lock();
            if state.in_flight > 0 {
                return;
            }
            let mut leaked = Vec::new();
            state.stubs.retain(|tracked| {
                let alive = tracked.stub.strong_count() > 0;
                if !alive {
                    leaked.push(tracked.name.clone());
                }
                alive
            });
            leaked
        };

        for name in leaked {
            tracing::warn!(service = %name, "Service leaked; it was dropped without being closed");
            self.listener.service_leaked(&name);
            self.outbound.disconnect(&name);
        }
    }

    fn generate_name(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{id}", self.prefix)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::Closed(CLOSED_MESSAGE.into()));
        }
        Ok(())
    }

    fn arc(&self) -> Result<Arc<Endpoint>> {
        self.this
            .upgrade()
            .ok_or_else(|| BridgeError::Closed(CLOSED_MESSAGE.into()))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct InboundChannel {
    endpoint: Weak<Endpoint>,
}

impl CallChannel for InboundChannel {
    fn service_names(&self) -> Vec<String> {
        self.endpoint
            .upgrade()
            .map(|endpoint| endpoint.service_names())
            .unwrap_or_default()
    }

    fn call(&self, encoded_call: &str) -> String {
        match self.endpoint.upgrade() {
            Some(endpoint) => endpoint.dispatch(encoded_call),
            None => ResultEnvelope::failure(&BridgeError::Closed(CLOSED_MESSAGE.into()).to_exception())
                .to_json(),
        }
    }

    fn disconnect(&self, name: &str) -> bool {
        self.endpoint
            .upgrade()
            .is_some_and(|endpoint| endpoint.remove(name))
    }
}

/// Cleans up an outbound suspending call that stopped waiting early.
struct SuspendGuard<'a> {
    endpoint: &'a Endpoint,
    callback_name: String,
    cancel: Option<OutboundService>,
    completed: bool,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.endpoint.abandon_continuation(&self.callback_name);
        if let Some(cancel) = self.cancel.take()
            && !self.endpoint.is_closed()
            && let Err(e) = cancel.call(CANCEL_SIGNATURE, Vec::new())
        {
            tracing::debug!(callback = %cancel.name(), error = %e, "Cancel callback failed");
        }
    }
}

struct InFlight<'a>(&'a Endpoint);

impl<'a> InFlight<'a> {
    fn enter(endpoint: &'a Endpoint) -> Self {
        endpoint.lock().in_flight += 1;
        Self(endpoint)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

fn call_event(
    service_name: &str,
    function: &ZiplineFunction,
    args: &[Value],
    internal: bool,
) -> Option<Call> {
    (!internal).then(|| Call {
        service_name: service_name.to_string(),
        signature: function.signature().to_string(),
        args: describe_args(args),
        suspending: function.is_suspending(),
    })
}

fn outbound_outcome(result: &Result<Value>) -> CallOutcome {
    match result {
        Ok(value) => CallOutcome::Success(format!("{value:?}")),
        Err(e) => CallOutcome::Failure(e.to_exception()),
    }
}

fn inbound_outcome(result: &Result<serde_json::Value, ZiplineException>) -> CallOutcome {
    match result {
        Ok(json) => CallOutcome::Success(json.to_string()),
        Err(exception) => CallOutcome::Failure(exception.clone()),
    }
}

fn no_such_service(called: &str, available: &[String]) -> BridgeError {
    BridgeError::ApiMismatch(format!(
        "no such service (service closed?)\n\tcalled service:\n\t\t{called}\n\tavailable services:\n\t\t{}",
        available.join("\n\t\t")
    ))
}

fn no_such_method(called: &str, available: &[String]) -> BridgeError {
    BridgeError::ApiMismatch(format!(
        "no such method (incompatible API versions?)\n\tcalled function:\n\t\t{called}\n\tavailable functions:\n\t\t{}",
        available.join("\n\t\t")
    ))
}
