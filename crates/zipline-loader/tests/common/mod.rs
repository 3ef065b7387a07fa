//! Fixtures shared by the loader integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use zipline_bridge::{CodecRegistry, ZiplineFile};
use zipline_loader::{
    LoadedManifest, LoaderError, ManifestVerifier, ZiplineCache, ZiplineHttpClient, ZiplineLoader,
    ZiplineManifest, ZiplineModule,
};
use zipline_testing::{FakeEngine, LoggingEventListener};

pub const MANIFEST_URL: &str = "https://example.com/files/test.zipline.json";
pub const ALPHA_URL: &str = "https://example.com/files/alpha.zipline";
pub const BRAVO_URL: &str = "https://example.com/files/bravo.zipline";

/// Serves a fixed set of URLs and records every request.
#[derive(Default)]
pub struct FakeHttpClient {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeHttpClient {
    pub fn serve(&self, files: &[(&str, &[u8])]) {
        *self.files.lock().unwrap() = files
            .iter()
            .map(|(url, bytes)| (url.to_string(), bytes.to_vec()))
            .collect();
    }

    pub fn take_requests(&self) -> Vec<String> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }
}

impl ZiplineHttpClient for FakeHttpClient {
    fn download<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, LoaderError>> + Send + 'a>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(url.to_string());
            self.files
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| LoaderError::Http {
                    url: url.to_string(),
                    message: "404 Not Found".to_string(),
                })
        })
    }
}

/// A module whose script logs "<id> loaded".
pub fn module_bytes(id: &str) -> Vec<u8> {
    ZiplineFile::new(format!("log {id} loaded\n").into_bytes())
        .write()
        .unwrap()
}

pub fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

pub struct Fixtures {
    pub alpha: Vec<u8>,
    pub bravo: Vec<u8>,
    pub manifest: ZiplineManifest,
}

impl Fixtures {
    /// "bravo" depends on "alpha"; main is `bravo.main`.
    pub fn new() -> Self {
        let alpha = module_bytes("alpha");
        let bravo = module_bytes("bravo");
        let modules = IndexMap::from([
            (
                "alpha".to_string(),
                ZiplineModule::new("alpha.zipline", sha256(&alpha), &[]),
            ),
            (
                "bravo".to_string(),
                ZiplineModule::new("bravo.zipline", sha256(&bravo), &["alpha"]),
            ),
        ]);
        let manifest = ZiplineManifest::create("bravo", "main", modules).unwrap();
        Self {
            alpha,
            bravo,
            manifest,
        }
    }

    pub fn manifest_bytes(&self) -> Vec<u8> {
        self.manifest.encode_json().unwrap()
    }

    pub fn loaded_manifest(&self) -> LoadedManifest {
        LoadedManifest::from_manifest(self.manifest.clone(), 1).unwrap()
    }

    pub fn alpha_hex(&self) -> String {
        hex::encode(sha256(&self.alpha))
    }

    pub fn bravo_hex(&self) -> String {
        hex::encode(sha256(&self.bravo))
    }

    /// Serve the manifest and both modules.
    pub fn serve_all(&self, http: &FakeHttpClient) {
        let manifest = self.manifest_bytes();
        http.serve(&[
            (MANIFEST_URL, manifest.as_slice()),
            (ALPHA_URL, self.alpha.as_slice()),
            (BRAVO_URL, self.bravo.as_slice()),
        ]);
    }
}

/// A loader wired to fakes, with a cache in a temporary directory.
pub struct LoaderTester {
    pub dir: TempDir,
    pub http: Arc<FakeHttpClient>,
    pub listener: Arc<LoggingEventListener>,
    pub cache: Arc<ZiplineCache>,
    pub codecs: Arc<CodecRegistry>,
}

impl LoaderTester {
    pub async fn new() -> Self {
        zipline_testing::init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path().join("cache"), 1024 * 1024)
            .await
            .unwrap();
        Self {
            dir,
            http: Arc::new(FakeHttpClient::default()),
            listener: Arc::new(LoggingEventListener::new()),
            cache: Arc::new(cache),
            codecs: Arc::new(CodecRegistry::new()),
        }
    }

    pub fn loader(&self, verifier: ManifestVerifier) -> ZiplineLoader {
        ZiplineLoader::new(
            FakeEngine::factory(self.codecs.clone()),
            self.codecs.clone(),
            self.http.clone(),
            verifier,
        )
        .with_event_listener(self.listener.clone())
        .with_cache(self.cache.clone())
    }

    pub fn unsigned_loader(&self) -> ZiplineLoader {
        self.loader(ManifestVerifier::no_signature_checks())
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

pub fn exists(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}
