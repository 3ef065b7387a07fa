use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::exception::ZiplineException;
use crate::function::ZiplineFunction;
use crate::value::Value;

pub type ServiceFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ZiplineException>> + Send + 'a>>;

/// A service implementation that can be bound to an endpoint.
///
/// Functions are dispatched by signature string, as declared in the
/// service's [`ServiceDescriptor`](crate::function::ServiceDescriptor).
/// Arguments arrive already decoded, in declaration order.
pub trait ZiplineService: Send + Sync + 'static {
    fn call(&self, function: &ZiplineFunction, args: Vec<Value>) -> Result<Value, ZiplineException>;

    /// Handle a `suspend fn`. The future is spawned on the endpoint's runtime
    /// and aborted if the caller cancels.
    fn call_suspending<'a>(
        &'a self,
        function: &'a ZiplineFunction,
        args: Vec<Value>,
    ) -> ServiceFuture<'a> {
        let _ = args;
        Box::pin(async move {
            Err(ZiplineException::new(
                "UnsupportedOperationException",
                format!("{} is not suspending", function.signature()),
            ))
        })
    }

    /// Called once the other side closes its reference to this service.
    fn close(&self) {}
}

/// A service bound on this side, with its functions resolved.
pub(crate) struct InboundService {
    pub name: String,
    pub service: Arc<dyn ZiplineService>,
    /// Internal callbacks don't produce call events.
    pub internal: bool,
    by_id: HashMap<String, Arc<ZiplineFunction>>,
    signatures: Vec<String>,
}

impl InboundService {
    pub fn new(
        name: String,
        service: Arc<dyn ZiplineService>,
        functions: Vec<Arc<ZiplineFunction>>,
        internal: bool,
    ) -> Self {
        let signatures = functions.iter().map(|f| f.signature().to_string()).collect();
        let by_id = functions
            .into_iter()
            .map(|f| (f.id().to_string(), f))
            .collect();
        Self {
            name,
            service,
            internal,
            by_id,
            signatures,
        }
    }

    pub fn function(&self, id: &str) -> Option<&Arc<ZiplineFunction>> {
        self.by_id.get(id)
    }

    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }
}
