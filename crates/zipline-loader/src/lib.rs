//! # zipline-loader
//!
//! Loads guest applications described by a manifest: a signed, ordered list
//! of modules with their SHA-256 digests. Modules come from files shipped
//! with the host, a content-addressed cache, or the network.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zipline_bridge::{CodecRegistry, GuestEngine};
//! use zipline_loader::{LoaderConfig, ReqwestHttpClient, ZiplineLoader};
//!
//! # async fn run(engine_factory: fn() -> Box<dyn GuestEngine>) -> zipline_loader::Result<()> {
//! let config = LoaderConfig::from_file("zipline.toml".as_ref())?;
//! let loader = ZiplineLoader::from_config(
//!     &config,
//!     engine_factory,
//!     Arc::new(CodecRegistry::new()),
//!     Arc::new(ReqwestHttpClient::new()),
//! )
//! .await?;
//!
//! let zipline = loader
//!     .load_once("red", "https://example.com/red.zipline.json", |_| Ok(()))
//!     .await
//!     .into_result()?;
//! println!("{:?}", zipline.service_names());
//! zipline.close();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod loader;
pub mod manifest;
pub mod signing;

pub use cache::ZiplineCache;
pub use config::LoaderConfig;
pub use error::{LoaderError, ManifestError, Result};
pub use fetcher::{FetchRequest, Fetcher, FetcherChain};
pub use http::{ReqwestHttpClient, ZiplineHttpClient};
pub use loader::{Clock, EngineFactory, LoadResult, ZiplineLoader};
pub use manifest::{LoadedManifest, ZiplineManifest, ZiplineModule};
pub use signing::{ManifestSigner, ManifestVerifier, SignatureAlgorithm};
