//! # Service function metadata
//!
//! A bridged interface is described by a static table of functions, built
//! once by the application and handed to `bind`/`take`. Each function is
//! identified on the wire by a hash of its signature string, so a host and a
//! guest built from different versions of an interface detect the mismatch
//! on the first call instead of decoding garbage.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::codec::TypeCodec;

pub const UNIT_TYPE: &str = "()";
pub const CLOSE_SIGNATURE: &str = "fn close(): ()";

/// One bridgeable function, before its types are resolved to codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub signature: String,
    pub arg_types: Vec<String>,
    pub result_type: String,
    pub suspending: bool,
}

impl FunctionDescriptor {
    /// A plain function: `fn name(A, B): R`.
    pub fn new(name: &str, arg_types: &[&str], result_type: &str) -> Self {
        Self::build(name, arg_types, result_type, false)
    }

    /// A suspending function: `suspend fn name(A, B): R`.
    pub fn suspending(name: &str, arg_types: &[&str], result_type: &str) -> Self {
        Self::build(name, arg_types, result_type, true)
    }

    fn build(name: &str, arg_types: &[&str], result_type: &str, suspending: bool) -> Self {
        let prefix = if suspending { "suspend fn" } else { "fn" };
        let signature = format!("{prefix} {name}({}): {result_type}", arg_types.join(", "));
        Self {
            signature,
            arg_types: arg_types.iter().map(|t| t.to_string()).collect(),
            result_type: result_type.to_string(),
            suspending,
        }
    }

    fn close() -> Self {
        Self::new("close", &[], UNIT_TYPE)
    }
}

/// The static description of a bridged interface.
///
/// `fn close(): ()` is always present; it is appended if the caller didn't
/// list it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub type_name: String,
    pub functions: Vec<FunctionDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(type_name: impl Into<String>, mut functions: Vec<FunctionDescriptor>) -> Self {
        if !functions.iter().any(|f| f.signature == CLOSE_SIGNATURE) {
            functions.push(FunctionDescriptor::close());
        }
        Self {
            type_name: type_name.into(),
            functions,
        }
    }

    pub fn function(&self, signature: &str) -> Option<&FunctionDescriptor> {
        self.functions.iter().find(|f| f.signature == signature)
    }
}

/// A function whose argument and result types have been resolved to codecs.
pub struct ZiplineFunction {
    signature: String,
    id: String,
    arg_codecs: Vec<Arc<dyn TypeCodec>>,
    result_codec: Arc<dyn TypeCodec>,
    suspending: bool,
}

impl ZiplineFunction {
    pub(crate) fn new(
        signature: String,
        arg_codecs: Vec<Arc<dyn TypeCodec>>,
        result_codec: Arc<dyn TypeCodec>,
        suspending: bool,
    ) -> Self {
        Self {
            id: function_id(&signature),
            signature,
            arg_codecs,
            result_codec,
            suspending,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The wire identifier: hex of the first 8 bytes of SHA-256(signature).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_suspending(&self) -> bool {
        self.suspending
    }

    pub fn is_close(&self) -> bool {
        self.signature == CLOSE_SIGNATURE
    }

    pub fn arg_codecs(&self) -> &[Arc<dyn TypeCodec>] {
        &self.arg_codecs
    }

    pub fn result_codec(&self) -> &Arc<dyn TypeCodec> {
        &self.result_codec
    }
}

impl fmt::Debug for ZiplineFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZiplineFunction")
            .field("signature", &self.signature)
            .field("id", &self.id)
            .finish()
    }
}

pub fn function_id(signature: &str) -> String {
    let digest = Sha256::digest(signature.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_rendered_consistently() {
        let echo = FunctionDescriptor::new("echo", &["EchoRequest"], "EchoResponse");
        assert_eq!(echo.signature, "fn echo(EchoRequest): EchoResponse");

        let suspending = FunctionDescriptor::suspending("suspendingEcho", &["EchoRequest"], "EchoResponse");
        assert_eq!(suspending.signature, "suspend fn suspendingEcho(EchoRequest): EchoResponse");
        assert!(suspending.suspending);

        let none = FunctionDescriptor::new("echo", &[], "EchoResponse");
        assert_eq!(none.signature, "fn echo(): EchoResponse");
    }

    #[test]
    fn descriptors_always_include_close() {
        let descriptor = ServiceDescriptor::new(
            "EchoService",
            vec![FunctionDescriptor::new("echo", &["EchoRequest"], "EchoResponse")],
        );
        assert_eq!(descriptor.functions.len(), 2);
        assert!(descriptor.function(CLOSE_SIGNATURE).is_some());

        let explicit = ServiceDescriptor::new("Closeable", vec![FunctionDescriptor::close()]);
        assert_eq!(explicit.functions.len(), 1);
    }

    #[test]
    fn function_ids_are_stable_and_distinct() {
        let a = function_id("fn echo(EchoRequest): EchoResponse");
        let b = function_id("fn echo(): EchoResponse");
        assert_eq!(a.len(), 16);
        assert_eq!(a, function_id("fn echo(EchoRequest): EchoResponse"));
        assert_ne!(a, b);
    }
}
