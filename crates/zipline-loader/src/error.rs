use thiserror::Error;
use zipline_bridge::BridgeError;

/// A module map that can't be loaded in order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("No topological ordering is possible for [{}]", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Modules are not topologically sorted and can not be loaded")]
    NotSorted,
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("checksum mismatch for {id}")]
    ChecksumMismatch { id: String },

    #[error("manifest signature for key {key} did not verify")]
    SignatureDidNotVerify { key: String },

    #[error("no trusted keys are configured")]
    NoTrustedKeys,

    #[error("invalid key {name}: {message}")]
    InvalidKey { name: String, message: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("no fetcher could provide module {id}")]
    ModuleUnavailable { id: String },

    #[error("download of {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = LoaderError> = std::result::Result<T, E>;
