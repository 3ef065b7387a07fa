//! # Flows
//!
//! A flow is a stream of values passed by reference. The sending side binds
//! a flow service exposing `suspend fn collect(collector)`. The receiving side
//! calls `collect` with a collector service of its own, and the sender pushes
//! each item through the collector's `suspend fn emit(item)`. Each emit is
//! awaited, so a slow consumer slows the producer down. The collector is
//! closed when the stream ends.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::codec::TypeCodec;
use crate::endpoint::Endpoint;
use crate::error::{BridgeError, Result};
use crate::exception::{CANCELLATION_EXCEPTION, ZiplineException};
use crate::function::{FunctionDescriptor, ServiceDescriptor, UNIT_TYPE, ZiplineFunction};
use crate::outbound::OutboundService;
use crate::service::{ServiceFuture, ZiplineService};
use crate::value::Value;

pub struct Flow {
    source: FlowSource,
}

enum FlowSource {
    Local(BoxStream<'static, Value>),
    Remote { stub: OutboundService, item_type: String },
}

impl Flow {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self {
            source: FlowSource::Local(stream.boxed()),
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self::from_stream(stream::iter(values))
    }

    pub(crate) fn remote(stub: OutboundService, item_type: String) -> Self {
        Self {
            source: FlowSource::Remote { stub, item_type },
        }
    }

    /// Consume the flow. Collection of a remote flow starts on first poll and
    /// is abandoned if the stream is dropped early.
    pub fn into_stream(self) -> BoxStream<'static, Result<Value>> {
        match self.source {
            FlowSource::Local(stream) => stream.map(Ok).boxed(),
            FlowSource::Remote { stub, item_type } => {
                let start = async move {
                    let (sender, receiver) = mpsc::channel(1);
                    let collector = Arc::new(FlowCollectorService::new(sender));
                    let collect = collect_signature(&item_type);

                    tokio::spawn(async move {
                        let result = stub
                            .call_suspending(&collect, vec![Value::service(collector.clone())])
                            .await;
                        if let Err(e) = result {
                            collector.send(Err(e)).await;
                        }
                        collector.finish();
                        stub.close();
                    });

                    stream::unfold(receiver, |mut receiver| async move {
                        receiver.recv().await.map(|item| (item, receiver))
                    })
                };
                stream::once(start).flatten().boxed()
            }
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            FlowSource::Local(_) => f.write_str("Flow(local)"),
            FlowSource::Remote { stub, .. } => write!(f, "Flow({})", stub.name()),
        }
    }
}

fn collector_type(item_type: &str) -> String {
    format!("FlowCollector<{item_type}>")
}

fn collect_function(item_type: &str) -> FunctionDescriptor {
    FunctionDescriptor::suspending("collect", &[&collector_type(item_type)], UNIT_TYPE)
}

fn emit_function(item_type: &str) -> FunctionDescriptor {
    FunctionDescriptor::suspending("emit", &[item_type], UNIT_TYPE)
}

pub fn collect_signature(item_type: &str) -> String {
    collect_function(item_type).signature
}

pub fn emit_signature(item_type: &str) -> String {
    emit_function(item_type).signature
}

/// Passes flows by reference.
pub struct FlowCodec {
    item_type: String,
    descriptor: ServiceDescriptor,
}

impl FlowCodec {
    pub fn new(flow_type: &str, item_type: &str) -> Self {
        Self {
            item_type: item_type.to_string(),
            descriptor: ServiceDescriptor::new(flow_type, vec![collect_function(item_type)]),
        }
    }

    pub fn collector_descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(
            collector_type(&self.item_type),
            vec![emit_function(&self.item_type)],
        )
    }
}

impl TypeCodec for FlowCodec {
    fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }

    fn encode(&self, value: Value, endpoint: &Endpoint) -> Result<serde_json::Value> {
        let service: Arc<dyn ZiplineService> = match value {
            Value::Null => return Ok(serde_json::Value::Null),
            Value::Flow(Flow {
                source: FlowSource::Local(stream),
            }) => Arc::new(FlowService::new(stream, &self.item_type)),
            Value::Flow(Flow {
                source: FlowSource::Remote { stub, .. },
            }) => Arc::new(stub),
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
                Ok(Value::Flow(Flow::remote(stub, self.item_type.clone())))
            }
            other => Err(BridgeError::Codec(format!(
                "expected a flow name for {}, got {other}",
                self.descriptor.type_name
            ))),
        }
    }

    fn service_descriptor(&self) -> Option<&ServiceDescriptor> {
        Some(&self.descriptor)
    }
}

/// The sending side of a flow. Can be collected once.
struct FlowService {
    stream: Mutex<Option<BoxStream<'static, Value>>>,
    emit: String,
}

impl FlowService {
    fn new(stream: BoxStream<'static, Value>, item_type: &str) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            emit: emit_signature(item_type),
        }
    }
}

impl ZiplineService for FlowService {
    fn call(&self, function: &ZiplineFunction, _args: Vec<Value>) -> Result<Value, ZiplineException> {
        Err(ZiplineException::new(
            "UnsupportedOperationException",
            format!("{} is not supported by a flow", function.signature()),
        ))
    }

    fn call_suspending<'a>(
        &'a self,
        _function: &'a ZiplineFunction,
        args: Vec<Value>,
    ) -> ServiceFuture<'a> {
        Box::pin(async move {
            let collector = args
                .into_iter()
                .next()
                .ok_or_else(|| BridgeError::Codec("collect requires a collector".into()))?
                .into_remote_service()?;

            let stream = self
                .stream
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(mut stream) = stream else {
                collector.close();
                return Err(ZiplineException::new(
                    "IllegalStateException",
                    "flow has already been collected",
                ));
            };

            while let Some(item) = stream.next().await {
                if let Err(e) = collector.call_suspending(&self.emit, vec![item]).await {
                    collector.close();
                    return Err(e.into());
                }
            }
            collector.close();
            Ok(Value::Null)
        })
    }

    fn close(&self) {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// The receiving side of a flow: forwards emitted items into a channel.
struct FlowCollectorService {
    sender: Mutex<Option<mpsc::Sender<Result<Value>>>>,
}

impl FlowCollectorService {
    fn new(sender: mpsc::Sender<Result<Value>>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns false once the consumer is gone or the collector finished.
    async fn send(&self, item: Result<Value>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sender {
            Some(sender) => sender.send(item).await.is_ok(),
            None => false,
        }
    }

    fn finish(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl ZiplineService for FlowCollectorService {
    fn call(&self, function: &ZiplineFunction, _args: Vec<Value>) -> Result<Value, ZiplineException> {
        Err(ZiplineException::new(
            "UnsupportedOperationException",
            format!("{} is not supported by a flow collector", function.signature()),
        ))
    }

    fn call_suspending<'a>(
        &'a self,
        _function: &'a ZiplineFunction,
        args: Vec<Value>,
    ) -> ServiceFuture<'a> {
        Box::pin(async move {
            let item = args.into_iter().next().unwrap_or(Value::Null);
            if self.send(Ok(item)).await {
                Ok(Value::Null)
            } else {
                Err(ZiplineException::new(
                    CANCELLATION_EXCEPTION,
                    "flow collector is closed",
                ))
            }
        })
    }

    fn close(&self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_signatures_name_the_item_type() {
        assert_eq!(
            collect_signature("String"),
            "suspend fn collect(FlowCollector<String>): ()"
        );
        assert_eq!(emit_signature("String"), "suspend fn emit(String): ()");

        let codec = FlowCodec::new("Flow<String>", "String");
        let collector = codec.collector_descriptor();
        assert_eq!(collector.type_name, "FlowCollector<String>");
        assert!(collector.function("suspend fn emit(String): ()").is_some());
    }

    #[tokio::test]
    async fn local_flows_stream_their_values() {
        let flow = Flow::from_values(vec![Value::string("a"), Value::string("b")]);
        let items: Vec<String> = flow
            .into_stream()
            .map(|item| item.unwrap().into_data::<String>().unwrap())
            .collect()
            .await;
        assert_eq!(items, ["a", "b"]);
    }
}
