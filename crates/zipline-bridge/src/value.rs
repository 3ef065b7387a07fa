use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::flow::Flow;
use crate::outbound::OutboundService;
use crate::service::ZiplineService;

/// A call argument or result as it moves through the bridge.
///
/// Plain data is carried as JSON. Services and flows are never inlined: the
/// codec binds them under a generated name and only the name crosses.
pub enum Value {
    Null,
    Data(serde_json::Value),
    Service(ServiceHandle),
    Flow(Flow),
}

/// A service value: either implemented on this side or a stub for the other.
#[derive(Clone)]
pub enum ServiceHandle {
    Local(Arc<dyn ZiplineService>),
    Remote(OutboundService),
}

impl Value {
    pub fn data<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Value::Data(serde_json::Value::String(value.into()))
    }

    pub fn service(service: Arc<dyn ZiplineService>) -> Self {
        Value::Service(ServiceHandle::Local(service))
    }

    pub(crate) fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            other => Value::Data(other),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Decode plain data into `T`. `Null` decodes as JSON null.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Value::Null => Ok(serde_json::from_value(serde_json::Value::Null)?),
            Value::Data(json) => Ok(serde_json::from_value(json)?),
            other => Err(BridgeError::Codec(format!("expected data, got {other:?}"))),
        }
    }

    pub fn into_service(self) -> Result<ServiceHandle> {
        match self {
            Value::Service(handle) => Ok(handle),
            other => Err(BridgeError::Codec(format!("expected a service, got {other:?}"))),
        }
    }

    /// Convenience for the common case of a service received from the other side.
    pub fn into_remote_service(self) -> Result<OutboundService> {
        match self.into_service()? {
            ServiceHandle::Remote(stub) => Ok(stub),
            ServiceHandle::Local(_) => Err(BridgeError::Codec(
                "expected a remote service, got a local one".into(),
            )),
        }
    }

    pub fn into_flow(self) -> Result<Flow> {
        match self {
            Value::Flow(flow) => Ok(flow),
            other => Err(BridgeError::Codec(format!("expected a flow, got {other:?}"))),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Data(json) => write!(f, "{json}"),
            Value::Service(ServiceHandle::Local(_)) => f.write_str("Service(local)"),
            Value::Service(ServiceHandle::Remote(stub)) => write!(f, "Service({})", stub.name()),
            Value::Flow(_) => f.write_str("Flow"),
        }
    }
}

/// Render call arguments for event listeners, e.g. `[{"message":"Jake"}]`.
pub(crate) fn describe_args(args: &[Value]) -> String {
    let rendered: Vec<String> = args.iter().map(|arg| format!("{arg:?}")).collect();
    format!("[{}]", rendered.join(", "))
}
