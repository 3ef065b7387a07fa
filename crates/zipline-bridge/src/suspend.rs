//! # Suspending calls
//!
//! A `suspend fn` call is two ordinary calls plus two short-lived services:
//!
//! 1. The caller binds a suspend callback and sends the call with the
//!    callback's name in the envelope.
//! 2. The callee spawns the work, binds a cancel callback and answers at once
//!    with the cancel callback's name.
//! 3. When the work completes the callee calls `invoke` on the suspend
//!    callback with the result envelope. The callback resumes the caller and
//!    unbinds itself.
//!
//! If the caller stops waiting first it calls `cancel`, which aborts the
//! callee's task.

use std::sync::{Arc, Weak};

use crate::codec::{CALL_RESULT_TYPE, ResultEnvelope};
use crate::endpoint::Endpoint;
use crate::error::BridgeError;
use crate::exception::ZiplineException;
use crate::function::{FunctionDescriptor, ServiceDescriptor, UNIT_TYPE, ZiplineFunction};
use crate::service::ZiplineService;
use crate::value::Value;

pub const SUSPEND_CALLBACK_TYPE: &str = "zipline::SuspendCallback";
pub const INVOKE_SIGNATURE: &str = "fn invoke(zipline::CallResult): ()";
pub const CANCEL_CALLBACK_TYPE: &str = "zipline::CancelCallback";
pub const CANCEL_SIGNATURE: &str = "fn cancel(): ()";

pub(crate) fn suspend_callback_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        SUSPEND_CALLBACK_TYPE,
        vec![FunctionDescriptor::new("invoke", &[CALL_RESULT_TYPE], UNIT_TYPE)],
    )
}

pub(crate) fn cancel_callback_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        CANCEL_CALLBACK_TYPE,
        vec![FunctionDescriptor::new("cancel", &[], UNIT_TYPE)],
    )
}

/// Receives the result of one outbound suspending call.
pub(crate) struct SuspendCallback {
    endpoint: Weak<Endpoint>,
    name: String,
    /// The suspending function being awaited; its result codec decodes the answer.
    function: Arc<ZiplineFunction>,
}

impl SuspendCallback {
    pub fn new(endpoint: Weak<Endpoint>, name: String, function: Arc<ZiplineFunction>) -> Self {
        Self {
            endpoint,
            name,
            function,
        }
    }
}

impl ZiplineService for SuspendCallback {
    fn call(&self, _function: &ZiplineFunction, args: Vec<Value>) -> Result<Value, ZiplineException> {
        let Some(endpoint) = self.endpoint.upgrade() else {
            return Ok(Value::Null);
        };
        let json = match args.into_iter().next() {
            Some(Value::Data(json)) => json,
            other => {
                return Err(BridgeError::Codec(format!("expected a call result, got {other:?}")).into());
            }
        };

        let result = serde_json::from_value::<ResultEnvelope>(json)
            .map_err(BridgeError::from)
            .and_then(ResultEnvelope::into_result)
            .and_then(|value| self.function.result_codec().decode(value, &endpoint));
        endpoint.complete_continuation(&self.name, result);
        Ok(Value::Null)
    }
}

/// Lets the caller of an inbound suspending call abort it.
pub(crate) struct CancelCallback {
    endpoint: Weak<Endpoint>,
    name: String,
}

impl CancelCallback {
    pub fn new(endpoint: Weak<Endpoint>, name: String) -> Self {
        Self { endpoint, name }
    }
}

impl ZiplineService for CancelCallback {
    fn call(&self, _function: &ZiplineFunction, _args: Vec<Value>) -> Result<Value, ZiplineException> {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.cancel_task(&self.name);
        }
        Ok(Value::Null)
    }
}
