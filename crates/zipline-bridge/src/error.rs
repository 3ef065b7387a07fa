use thiserror::Error;

use crate::bundle::BundleError;
use crate::engine::EngineError;
use crate::exception::{
    API_MISMATCH_EXCEPTION, CANCELLATION_EXCEPTION, CLOSED_EXCEPTION, ZiplineException,
};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Unknown service name or unknown function signature on the receiving side.
    #[error("{0}")]
    ApiMismatch(String),

    #[error("serializer not configured for {type_name} (required by {context})")]
    SerializerNotConfigured { type_name: String, context: String },

    #[error("{0} is already bound")]
    AlreadyBound(String),

    #[error("{0}")]
    Closed(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    Remote(ZiplineException),

    #[error("codec error: {0}")]
    Codec(String),

    /// A module id or function name that can't be named in a guest script.
    #[error("invalid entry point: {0}")]
    InvalidEntryPoint(String),

    #[error("suspending calls require a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Map an exception received over the wire back onto the local taxonomy.
    pub fn from_remote(exception: ZiplineException) -> Self {
        match exception.kind.as_str() {
            API_MISMATCH_EXCEPTION => BridgeError::ApiMismatch(exception.message),
            CLOSED_EXCEPTION => BridgeError::Closed(exception.message),
            CANCELLATION_EXCEPTION => BridgeError::Cancelled(exception.message),
            _ => BridgeError::Remote(exception),
        }
    }

    /// Encode this error as an exception for the other side of the bridge.
    pub fn to_exception(&self) -> ZiplineException {
        match self {
            BridgeError::ApiMismatch(message) => {
                ZiplineException::new(API_MISMATCH_EXCEPTION, message.clone())
            }
            BridgeError::Closed(message) => ZiplineException::new(CLOSED_EXCEPTION, message.clone()),
            BridgeError::Cancelled(message) => {
                ZiplineException::new(CANCELLATION_EXCEPTION, message.clone())
            }
            BridgeError::Remote(exception) => exception.clone(),
            other => ZiplineException::new("ZiplineException", other.to_string()),
        }
    }
}

impl From<BridgeError> for ZiplineException {
    fn from(error: BridgeError) -> Self {
        error.to_exception()
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_mismatch_survives_the_wire() {
        let error = BridgeError::ApiMismatch("no such service (service closed?)".into());
        let text = error.to_exception().to_text();

        let decoded = BridgeError::from_remote(ZiplineException::from_text(&text));
        assert!(matches!(decoded, BridgeError::ApiMismatch(ref m) if m.starts_with("no such service")));
    }

    #[test]
    fn unknown_kinds_stay_remote() {
        let exception = ZiplineException::new("IllegalStateException", "boom");
        let decoded = BridgeError::from_remote(exception.clone());
        assert!(matches!(decoded, BridgeError::Remote(e) if e == exception));
    }
}
