//! # Serializers
//!
//! Every value that crosses the bridge is described by a type name (as it
//! appears in a function signature) and converted by the codec registered for
//! that name. Plain data becomes JSON. Service and flow types are passed by
//! reference: encoding binds them under a generated name, decoding wraps the
//! name in a stub.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::endpoint::Endpoint;
use crate::error::{BridgeError, Result};
use crate::exception::ZiplineException;
use crate::flow::FlowCodec;
use crate::function::{FunctionDescriptor, ServiceDescriptor, UNIT_TYPE, ZiplineFunction};
use crate::value::{ServiceHandle, Value};

/// Type name of the raw result envelope delivered to suspend callbacks.
pub const CALL_RESULT_TYPE: &str = "zipline::CallResult";

/// One call, as written to the call channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub service: String,
    /// Hash of `signature`; see [`crate::function::function_id`].
    pub function: String,
    pub signature: String,
    pub args: Vec<serde_json::Value>,
    /// Name of the suspend callback, present only for suspending calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl CallEnvelope {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The answer to one call: `{"success": value}` or `{"failure": text}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultEnvelope {
    Success(serde_json::Value),
    Failure(String),
}

impl ResultEnvelope {
    pub fn success(value: serde_json::Value) -> Self {
        ResultEnvelope::Success(value)
    }

    pub fn failure(exception: &ZiplineException) -> Self {
        ResultEnvelope::Failure(exception.to_text())
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ResultEnvelope::Success(value) => json!({ "success": value }),
            ResultEnvelope::Failure(text) => json!({ "failure": text }),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Split into the success payload or the remote failure, mapped onto
    /// [`BridgeError`].
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            ResultEnvelope::Success(value) => Ok(value),
            ResultEnvelope::Failure(text) => {
                Err(BridgeError::from_remote(ZiplineException::from_text(&text)))
            }
        }
    }
}

/// Converts values of one named type to and from JSON.
pub trait TypeCodec: Send + Sync {
    fn type_name(&self) -> &str;

    fn encode(&self, value: Value, endpoint: &Endpoint) -> Result<serde_json::Value>;

    fn decode(&self, json: serde_json::Value, endpoint: &Endpoint) -> Result<Value>;

    /// The interface of a pass-by-reference type, if this is one.
    fn service_descriptor(&self) -> Option<&ServiceDescriptor> {
        None
    }
}

/// Plain data validated against a serde type.
///
/// The JSON is passed through unchanged once `T` accepts it, so key order
/// and number formatting survive the trip.
pub struct JsonCodec<T> {
    type_name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JsonCodec<T> {
    fn check(&self, json: &serde_json::Value) -> Result<()> {
        T::deserialize(json).map(drop).map_err(|e| {
            BridgeError::Codec(format!("{} rejected {json}: {e}", self.type_name))
        })
    }
}

impl<T: DeserializeOwned> TypeCodec for JsonCodec<T> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn encode(&self, value: Value, _endpoint: &Endpoint) -> Result<serde_json::Value> {
        let json = match value {
            Value::Null => serde_json::Value::Null,
            Value::Data(json) => json,
            other => {
                return Err(BridgeError::Codec(format!(
                    "{} cannot encode {other:?}",
                    self.type_name
                )));
            }
        };
        self.check(&json)?;
        Ok(json)
    }

    fn decode(&self, json: serde_json::Value, _endpoint: &Endpoint) -> Result<Value> {
        self.check(&json)?;
        Ok(Value::from_json(json))
    }
}

struct UnitCodec;

impl TypeCodec for UnitCodec {
    fn type_name(&self) -> &str {
        UNIT_TYPE
    }

    fn encode(&self, _value: Value, _endpoint: &Endpoint) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn decode(&self, _json: serde_json::Value, _endpoint: &Endpoint) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Passes a result envelope through untouched.
struct CallResultCodec;

impl TypeCodec for CallResultCodec {
    fn type_name(&self) -> &str {
        CALL_RESULT_TYPE
    }

    fn encode(&self, value: Value, _endpoint: &Endpoint) -> Result<serde_json::Value> {
        match value {
            Value::Data(json) => Ok(json),
            Value::Null => Ok(serde_json::Value::Null),
            other => Err(BridgeError::Codec(format!("not a call result: {other:?}"))),
        }
    }

    fn decode(&self, json: serde_json::Value, _endpoint: &Endpoint) -> Result<Value> {
        Ok(Value::from_json(json))
    }
}

/// A service type passed by reference.
pub struct ServiceCodec {
    descriptor: ServiceDescriptor,
}

impl ServiceCodec {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self { descriptor }
    }
}

impl TypeCodec for ServiceCodec {
    fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }

    fn encode(&self, value: Value, endpoint: &Endpoint) -> Result<serde_json::Value> {
        let service = match value {
            Value::Null => return Ok(serde_json::Value::Null),
            Value::Service(ServiceHandle::Local(service)) => service,
            Value::Service(ServiceHandle::Remote(stub)) => Arc::new(stub),
            other => {
                return Err(BridgeError::Codec(format!(
                    "{} cannot encode {other:?}",
                    self.descriptor.type_name
                )));
            }
        };
        let name = endpoint.bind_by_reference(&self.descriptor, service)?;
        Ok(serde_json::Value::String(name))
    }

    fn decode(&self, json: serde_json::Value, endpoint: &Endpoint) -> Result<Value> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::String(name) => {
                let stub = endpoint.take_by_reference(&name, &self.descriptor)?;
                Ok(Value::Service(ServiceHandle::Remote(stub)))
            }
            other => Err(BridgeError::Codec(format!(
                "expected a service name for {}, got {other}",
                self.descriptor.type_name
            ))),
        }
    }

    fn service_descriptor(&self) -> Option<&ServiceDescriptor> {
        Some(&self.descriptor)
    }
}

/// Maps type names to codecs. Shared by both endpoints of a bridge and
/// immutable once wrapped in an `Arc`.
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn TypeCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// A registry holding the built-in types.
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry
            .register(Arc::new(UnitCodec))
            .register(Arc::new(CallResultCodec))
            .register_json::<bool>("bool")
            .register_json::<i32>("i32")
            .register_json::<i64>("i64")
            .register_json::<f64>("f64")
            .register_json::<String>("String")
            .register_json::<Option<String>>("Option<String>")
            .register_json::<Vec<String>>("Vec<String>")
            .register_json::<BTreeMap<String, String>>("Map<String,String>");
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn TypeCodec>) -> &mut Self {
        self.codecs.insert(codec.type_name().to_string(), codec);
        self
    }

    pub fn register_json<T>(&mut self, type_name: &str) -> &mut Self
    where
        T: DeserializeOwned + 'static,
    {
        self.register(Arc::new(JsonCodec::<T>::new(type_name)))
    }

    pub fn register_service(&mut self, descriptor: ServiceDescriptor) -> &mut Self {
        self.register(Arc::new(ServiceCodec::new(descriptor)))
    }

    /// Register a flow type and the collector interface its items arrive on.
    pub fn register_flow(&mut self, flow_type: &str, item_type: &str) -> &mut Self {
        let codec = FlowCodec::new(flow_type, item_type);
        let collector = codec.collector_descriptor();
        self.register_service(collector);
        self.register(Arc::new(codec))
    }

    pub fn codec(&self, type_name: &str) -> Option<Arc<dyn TypeCodec>> {
        self.codecs.get(type_name).cloned()
    }

    /// Resolve every function of `descriptor` to its codecs.
    ///
    /// Service types reachable from the descriptor are checked too, so a
    /// missing serializer fails here rather than on the first call that
    /// happens to pass such a value.
    pub fn resolve(&self, descriptor: &ServiceDescriptor) -> Result<Vec<Arc<ZiplineFunction>>> {
        let mut visited = HashSet::from([descriptor.type_name.clone()]);
        self.check(descriptor, &mut visited)?;

        descriptor
            .functions
            .iter()
            .map(|function| {
                let arg_codecs = function
                    .arg_types
                    .iter()
                    .map(|t| self.require(t, descriptor, function))
                    .collect::<Result<Vec<_>>>()?;
                let result_codec = self.require(&function.result_type, descriptor, function)?;
                Ok(Arc::new(ZiplineFunction::new(
                    function.signature.clone(),
                    arg_codecs,
                    result_codec,
                    function.suspending,
                )))
            })
            .collect()
    }

    fn check(&self, descriptor: &ServiceDescriptor, visited: &mut HashSet<String>) -> Result<()> {
        for function in &descriptor.functions {
            let types = function
                .arg_types
                .iter()
                .chain(std::iter::once(&function.result_type));
            for type_name in types {
                let codec = self.require(type_name, descriptor, function)?;
                if let Some(nested) = codec.service_descriptor()
                    && visited.insert(nested.type_name.clone())
                {
                    self.check(nested, visited)?;
                }
            }
        }
        Ok(())
    }

    fn require(
        &self,
        type_name: &str,
        descriptor: &ServiceDescriptor,
        function: &FunctionDescriptor,
    ) -> Result<Arc<dyn TypeCodec>> {
        self.codec(type_name)
            .ok_or_else(|| BridgeError::SerializerNotConfigured {
                type_name: type_name.to_string(),
                context: format!("{}.{}", descriptor.type_name, function.signature),
            })
    }
}
