//! Call bridge between a host application and a sandboxed guest.
//!
//! Each side of the bridge is an [`Endpoint`]. Services are bound on one
//! side and called through stubs ([`OutboundService`]) on the other. Calls
//! travel as JSON strings over a [`CallChannel`]; functions are matched by a
//! hash of their signature, so incompatible API versions fail with a
//! descriptive error instead of misbehaving.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zipline_bridge::{
//!     CodecRegistry, FunctionDescriptor, NoopEventListener, ServiceDescriptor, Value, Zipline,
//! };
//!
//! # fn run(engine: Box<dyn zipline_bridge::GuestEngine>) -> zipline_bridge::Result<()> {
//! let greeter = ServiceDescriptor::new(
//!     "Greeter",
//!     vec![FunctionDescriptor::new("hello", &["String"], "String")],
//! );
//!
//! let zipline = Zipline::create(engine, Arc::new(CodecRegistry::new()), Arc::new(NoopEventListener));
//! let stub = zipline.take("greeter", &greeter)?;
//! let reply = stub.call("fn hello(String): String", vec![Value::string("Jake")])?;
//! stub.close();
//! zipline.close();
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod channel;
pub mod codec;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod exception;
pub mod flow;
pub mod function;
pub mod outbound;
pub mod service;
pub mod suspend;
pub mod value;
pub mod zipline;

pub use bundle::{BundleError, CURRENT_ZIPLINE_VERSION, ZiplineFile};
pub use channel::{CallChannel, DeferredChannel};
pub use codec::{CodecRegistry, TypeCodec};
pub use context::GuestContext;
pub use endpoint::Endpoint;
pub use engine::{EngineError, GuestCode, GuestEngine};
pub use error::{BridgeError, Result};
pub use events::{Call, CallOutcome, CallToken, EventListener, NoopEventListener};
pub use exception::ZiplineException;
pub use flow::Flow;
pub use function::{FunctionDescriptor, ServiceDescriptor, ZiplineFunction};
pub use outbound::OutboundService;
pub use service::{ServiceFuture, ZiplineService};
pub use value::{ServiceHandle, Value};
pub use zipline::Zipline;
