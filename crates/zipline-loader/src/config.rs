use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::ZiplineCache;
use crate::error::{LoaderError, Result};
use crate::signing::{ManifestVerifier, SignatureAlgorithm};

#[derive(Debug, Default, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_max_size_in_bytes")]
    pub max_size_in_bytes: u64,
}

fn default_cache_directory() -> PathBuf {
    ZiplineCache::default_path()
}
fn default_max_size_in_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            max_size_in_bytes: default_max_size_in_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,
    /// Modules shipped with the host, named by their SHA-256.
    pub embedded_directory: Option<PathBuf>,
}

fn default_concurrent_downloads() -> usize {
    3
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: default_concurrent_downloads(),
            embedded_directory: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_require_signatures")]
    pub require_signatures: bool,
    #[serde(default)]
    pub trusted_keys: Vec<TrustedKey>,
}

fn default_require_signatures() -> bool {
    true
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            require_signatures: default_require_signatures(),
            trusted_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrustedKey {
    pub name: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: SignatureAlgorithm,
    /// Hex encoded.
    pub public_key: String,
}

fn default_algorithm() -> SignatureAlgorithm {
    SignatureAlgorithm::Ed25519
}

impl LoaderConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LoaderError::Config(format!("Failed to parse config: {e}")))
    }

    /// The verifier for `[signing]`.
    ///
    /// `require_signatures = false` turns signature checks off. Requiring
    /// signatures without trusting any key is an error.
    pub fn manifest_verifier(&self) -> Result<ManifestVerifier> {
        if !self.signing.require_signatures {
            return Ok(ManifestVerifier::no_signature_checks());
        }
        if self.signing.trusted_keys.is_empty() {
            return Err(LoaderError::Config(
                "signatures are required but no trusted keys are configured".into(),
            ));
        }

        let mut verifier = ManifestVerifier::new();
        for key in &self.signing.trusted_keys {
            verifier = verifier.add(&key.name, key.algorithm, &key.public_key)?;
        }
        Ok(verifier)
    }

    pub async fn open_cache(&self) -> Result<ZiplineCache> {
        ZiplineCache::open(&self.cache.directory, self.cache.max_size_in_bytes).await
    }
}
