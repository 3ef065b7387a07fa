//! Sample services shared by the bridge and loader tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use zipline_bridge::{
    CodecRegistry, FunctionDescriptor, ServiceDescriptor, ServiceFuture, Value, ZiplineException,
    ZiplineFunction, ZiplineService,
};

pub const ECHO_SIGNATURE: &str = "fn echo(EchoRequest): EchoResponse";
pub const ECHO_WITHOUT_ARGS_SIGNATURE: &str = "fn echo(): EchoResponse";
pub const SUSPENDING_ECHO_SIGNATURE: &str = "suspend fn suspendingEcho(EchoRequest): EchoResponse";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub message: String,
}

pub fn echo_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "EchoService",
        vec![FunctionDescriptor::new("echo", &["EchoRequest"], "EchoResponse")],
    )
}

/// An older `EchoService` whose `echo` took no arguments.
pub fn echo_service_without_args_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "EchoService",
        vec![FunctionDescriptor::new("echo", &[], "EchoResponse")],
    )
}

pub fn suspending_echo_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "SuspendingEchoService",
        vec![FunctionDescriptor::suspending(
            "suspendingEcho",
            &["EchoRequest"],
            "EchoResponse",
        )],
    )
}

/// Codecs for the echo types, both echo services and `Flow<String>`.
pub fn echo_codecs() -> CodecRegistry {
    let mut codecs = CodecRegistry::new();
    codecs
        .register_json::<EchoRequest>("EchoRequest")
        .register_json::<EchoResponse>("EchoResponse")
        .register_service(echo_service_descriptor())
        .register_service(suspending_echo_service_descriptor())
        .register_flow("Flow<String>", "String");
    codecs
}

fn request(args: Vec<Value>) -> Result<EchoRequest, ZiplineException> {
    let arg = args.into_iter().next().unwrap_or(Value::Null);
    Ok(arg.into_data()?)
}

fn unsupported(function: &ZiplineFunction) -> ZiplineException {
    ZiplineException::new(
        "UnsupportedOperationException",
        format!("unexpected call to {}", function.signature()),
    )
}

/// Replies `"<greeting>, <message>"`.
pub struct EchoService {
    greeting: String,
    requests: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl EchoService {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            requests: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ZiplineService for EchoService {
    fn call(&self, function: &ZiplineFunction, args: Vec<Value>) -> Result<Value, ZiplineException> {
        if function.signature() != ECHO_SIGNATURE {
            return Err(unsupported(function));
        }
        let request = request(args)?;
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.message.clone());
        let response = EchoResponse {
            message: format!("{}, {}", self.greeting, request.message),
        };
        Ok(Value::data(&response)?)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Replies like [`EchoService`], but only once [`release`](Self::release)
/// hands out a permit, so tests control when a suspended call completes.
pub struct SuspendingEchoService {
    greeting: String,
    permits: Semaphore,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl SuspendingEchoService {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            permits: Semaphore::new(0),
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    /// Allow `count` more calls to complete.
    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Calls dropped before they completed.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Counts a cancellation unless disarmed.
struct CancelTracker<'a> {
    cancelled: &'a AtomicUsize,
    armed: bool,
}

impl Drop for CancelTracker<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl ZiplineService for SuspendingEchoService {
    fn call(&self, function: &ZiplineFunction, _args: Vec<Value>) -> Result<Value, ZiplineException> {
        Err(unsupported(function))
    }

    fn call_suspending<'a>(
        &'a self,
        function: &'a ZiplineFunction,
        args: Vec<Value>,
    ) -> ServiceFuture<'a> {
        Box::pin(async move {
            if function.signature() != SUSPENDING_ECHO_SIGNATURE {
                return Err(unsupported(function));
            }
            let request = request(args)?;
            let mut tracker = CancelTracker {
                cancelled: &self.cancelled,
                armed: true,
            };
            let permit = self.permits.acquire().await.map_err(|e| {
                ZiplineException::new("IllegalStateException", e.to_string())
            })?;
            permit.forget();

            tracker.armed = false;
            self.completed.fetch_add(1, Ordering::AcqRel);
            let response = EchoResponse {
                message: format!("{}, {}", self.greeting, request.message),
            };
            Ok(Value::data(&response)?)
        })
    }
}
