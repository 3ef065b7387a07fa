//! # Loader
//!
//! Turns a manifest URL into a running [`Zipline`]:
//!
//! 1. download the manifest (falling back to the last manifest that loaded
//!    successfully, or one shipped with the host)
//! 2. verify its signatures
//! 3. fetch every module through the fetcher chain, in parallel
//! 4. check every module against its SHA-256 digest
//! 5. create the guest, run the initializer, load modules in order, call main
//!
//! Nothing reaches the guest engine until every module has been fetched and
//! checked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::stream::{self, Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use zipline_bridge::{CodecRegistry, EventListener, GuestEngine, NoopEventListener, Zipline};

use crate::cache::{ZiplineCache, write_atomically};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::fetcher::{
    CachingFetcher, EmbeddedFetcher, FetchRequest, Fetcher, FetcherChain, HttpFetcher,
};
use crate::http::ZiplineHttpClient;
use crate::manifest::{LoadedManifest, ZiplineManifest, application_manifest_file_name};
use crate::signing::ManifestVerifier;

pub type EngineFactory = Arc<dyn Fn() -> Box<dyn GuestEngine> + Send + Sync>;

/// Milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug)]
pub enum LoadResult {
    Success {
        zipline: Arc<Zipline>,
        manifest: ZiplineManifest,
        fresh_at_epoch_ms: u64,
    },
    Failure(LoaderError),
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, LoadResult::Success { .. })
    }

    pub fn zipline(&self) -> Option<&Arc<Zipline>> {
        match self {
            LoadResult::Success { zipline, .. } => Some(zipline),
            LoadResult::Failure(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Arc<Zipline>> {
        match self {
            LoadResult::Success { zipline, .. } => Ok(zipline),
            LoadResult::Failure(e) => Err(e),
        }
    }
}

/// One element of a continuous load.
enum Attempt {
    Skipped,
    Finished {
        result: LoadResult,
        manifest_bytes: Option<Vec<u8>>,
    },
}

pub struct ZiplineLoader {
    engine_factory: EngineFactory,
    codecs: Arc<CodecRegistry>,
    http_client: Arc<dyn ZiplineHttpClient>,
    verifier: ManifestVerifier,
    listener: Arc<dyn EventListener>,
    cache: Option<Arc<ZiplineCache>>,
    embedded_directory: Option<PathBuf>,
    permits: Arc<Semaphore>,
    clock: Clock,
}

impl ZiplineLoader {
    /// A loader with no cache and no embedded files.
    ///
    /// Pass [`ManifestVerifier::no_signature_checks`] to load unsigned
    /// manifests.
    pub fn new(
        engine_factory: impl Fn() -> Box<dyn GuestEngine> + Send + Sync + 'static,
        codecs: Arc<CodecRegistry>,
        http_client: Arc<dyn ZiplineHttpClient>,
        verifier: ManifestVerifier,
    ) -> Self {
        Self {
            engine_factory: Arc::new(engine_factory),
            codecs,
            http_client,
            verifier,
            listener: Arc::new(NoopEventListener),
            cache: None,
            embedded_directory: None,
            permits: Arc::new(Semaphore::new(3)),
            clock: Arc::new(system_clock),
        }
    }

    /// Build a loader from `config`, opening its cache.
    pub async fn from_config(
        config: &LoaderConfig,
        engine_factory: impl Fn() -> Box<dyn GuestEngine> + Send + Sync + 'static,
        codecs: Arc<CodecRegistry>,
        http_client: Arc<dyn ZiplineHttpClient>,
    ) -> Result<Self> {
        let cache = config.open_cache().await?;
        let mut loader = Self::new(engine_factory, codecs, http_client, config.manifest_verifier()?)
            .with_cache(Arc::new(cache))
            .with_concurrent_downloads(config.download.concurrent_downloads);
        if let Some(directory) = &config.download.embedded_directory {
            loader = loader.with_embedded_directory(directory);
        }
        Ok(loader)
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ZiplineCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Modules and manifests shipped with the host.
    pub fn with_embedded_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.embedded_directory = Some(directory.into());
        self
    }

    pub fn with_concurrent_downloads(mut self, concurrent_downloads: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(concurrent_downloads.max(1)));
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Load the application at `manifest_url`.
    ///
    /// If the manifest can't be downloaded or parsed, the application's last
    /// successfully loaded manifest is used instead, then the embedded one.
    pub async fn load_once<I>(
        &self,
        application_name: &str,
        manifest_url: &str,
        initializer: I,
    ) -> LoadResult
    where
        I: Fn(&Zipline) -> zipline_bridge::Result<()> + Sync,
    {
        self.listener
            .application_load_start(application_name, Some(manifest_url));

        let result = match self.fetch_manifest(application_name, manifest_url).await {
            Ok(loaded) => {
                self.load_manifest(application_name, Some(manifest_url), loaded, &initializer)
                    .await
            }
            Err(e) => match self.local_manifest(application_name).await {
                Some(loaded) => {
                    tracing::warn!(
                        application = %application_name,
                        url = %manifest_url,
                        error = %e,
                        "Manifest unavailable, loading local copy"
                    );
                    self.load_manifest(application_name, Some(manifest_url), loaded, &initializer)
                        .await
                }
                None => Err(e),
            },
        };
        self.report(application_name, Some(manifest_url), result)
    }

    /// Load an application from a manifest already in hand.
    pub async fn load_from_manifest<I>(
        &self,
        application_name: &str,
        loaded_manifest: LoadedManifest,
        initializer: I,
    ) -> LoadResult
    where
        I: Fn(&Zipline) -> zipline_bridge::Result<()> + Sync,
    {
        self.listener.application_load_start(application_name, None);
        let result = self
            .load_manifest(application_name, None, loaded_manifest, &initializer)
            .await;
        self.report(application_name, None, result)
    }

    /// Load each manifest URL `manifest_urls` produces.
    ///
    /// A manifest identical to the last one that loaded is skipped: no item
    /// is produced and the running guest should be kept. A failed load
    /// produces a [`LoadResult::Failure`] and loading continues with the
    /// next URL.
    pub fn load_continuously<'a, S, I>(
        &'a self,
        application_name: &'a str,
        manifest_urls: S,
        initializer: I,
    ) -> impl Stream<Item = LoadResult> + 'a
    where
        S: Stream<Item = String> + Send + 'a,
        I: Fn(&Zipline) -> zipline_bridge::Result<()> + Send + Sync + 'a,
    {
        let state = (manifest_urls.boxed(), None::<Vec<u8>>, initializer);
        stream::unfold(state, move |(mut urls, mut previous, initializer)| async move {
            loop {
                let url = urls.next().await?;
                match self
                    .load_if_changed(application_name, &url, previous.as_deref(), &initializer)
                    .await
                {
                    Attempt::Skipped => continue,
                    Attempt::Finished {
                        result,
                        manifest_bytes,
                    } => {
                        if manifest_bytes.is_some() {
                            previous = manifest_bytes;
                        }
                        return Some((result, (urls, previous, initializer)));
                    }
                }
            }
        })
    }

    /// Download the manifest at `manifest_url` and all of its modules into
    /// `download_dir`, without starting a guest.
    ///
    /// The result can be used as an embedded directory.
    pub async fn download(
        &self,
        application_name: &str,
        download_dir: &Path,
        manifest_url: &str,
    ) -> Result<()> {
        let loaded = self.fetch_manifest(application_name, manifest_url).await?;
        self.download_to(application_name, download_dir, Some(manifest_url), &loaded)
            .await
    }

    /// Like [`download`](Self::download), for a manifest already in hand.
    pub async fn download_manifest(
        &self,
        application_name: &str,
        download_dir: &Path,
        loaded_manifest: &LoadedManifest,
    ) -> Result<()> {
        self.download_to(application_name, download_dir, None, loaded_manifest)
            .await
    }

    async fn load_if_changed<I>(
        &self,
        application_name: &str,
        manifest_url: &str,
        previous: Option<&[u8]>,
        initializer: &I,
    ) -> Attempt
    where
        I: Fn(&Zipline) -> zipline_bridge::Result<()> + Sync,
    {
        self.listener
            .application_load_start(application_name, Some(manifest_url));

        let loaded = match self.fetch_manifest(application_name, manifest_url).await {
            Ok(loaded) => loaded,
            Err(e) => {
                return Attempt::Finished {
                    result: self.report(application_name, Some(manifest_url), Err(e)),
                    manifest_bytes: None,
                };
            }
        };

        if previous == Some(loaded.manifest_bytes.as_slice()) {
            tracing::info!(application = %application_name, url = %manifest_url, "Manifest unchanged, load skipped");
            self.listener
                .application_load_skipped(application_name, manifest_url);
            return Attempt::Skipped;
        }

        let manifest_bytes = loaded.manifest_bytes.clone();
        let result = self
            .load_manifest(application_name, Some(manifest_url), loaded, initializer)
            .await;
        let manifest_bytes = result.is_ok().then_some(manifest_bytes);
        Attempt::Finished {
            result: self.report(application_name, Some(manifest_url), result),
            manifest_bytes,
        }
    }

    async fn fetch_manifest(
        &self,
        application_name: &str,
        manifest_url: &str,
    ) -> Result<LoadedManifest> {
        let bytes = self
            .http_fetcher()
            .download(application_name, manifest_url)
            .await?;
        LoadedManifest::parse(bytes, self.now()).inspect_err(|e| {
            tracing::warn!(application = %application_name, url = %manifest_url, error = %e, "Manifest parse failed");
            self.listener
                .manifest_parse_failed(application_name, Some(manifest_url), e);
        })
    }

    /// The pinned manifest from the cache, else the embedded one.
    async fn local_manifest(&self, application_name: &str) -> Option<LoadedManifest> {
        if let Some(cache) = &self.cache {
            match cache.pinned_manifest(application_name, self.now()).await {
                Ok(Some(loaded)) => return Some(loaded),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(application = %application_name, error = %e, "Pinned manifest unreadable");
                }
            }
        }

        let directory = self.embedded_directory.as_ref()?;
        let path = directory.join(application_manifest_file_name(application_name));
        let bytes = tokio::fs::read(&path).await.ok()?;
        match LoadedManifest::parse(bytes, 0) {
            Ok(loaded) => Some(loaded),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Embedded manifest unreadable");
                self.listener
                    .manifest_parse_failed(application_name, None, &e);
                None
            }
        }
    }

    async fn load_manifest<I>(
        &self,
        application_name: &str,
        manifest_url: Option<&str>,
        loaded: LoadedManifest,
        initializer: &I,
    ) -> Result<(Arc<Zipline>, LoadedManifest)>
    where
        I: Fn(&Zipline) -> zipline_bridge::Result<()> + Sync,
    {
        self.verifier
            .verify(&loaded.manifest_bytes, &loaded.manifest)?;

        let chain = self.module_fetchers();
        let base_url = loaded.manifest.base_url().or(manifest_url);
        let modules = self
            .fetch_modules(application_name, &chain, &loaded.manifest, base_url)
            .await?;

        let zipline = Zipline::create(
            (self.engine_factory)(),
            self.codecs.clone(),
            self.listener.clone(),
        );
        if let Err(e) = start(&zipline, &loaded.manifest, &modules, initializer) {
            zipline.close();
            return Err(e);
        }

        if let Some(cache) = &self.cache {
            let module_keys: Vec<String> = loaded
                .manifest
                .modules()
                .values()
                .map(|module| module.sha256_hex())
                .collect();
            if let Err(e) = cache
                .pin(
                    application_name,
                    &loaded.manifest_bytes,
                    &module_keys,
                    loaded.fresh_at_epoch_ms,
                    self.now(),
                )
                .await
            {
                tracing::warn!(application = %application_name, error = %e, "Failed to pin application");
            }
        }

        Ok((zipline, loaded))
    }

    /// Every module's bytes in load order, each checked against its digest.
    async fn fetch_modules(
        &self,
        application_name: &str,
        chain: &FetcherChain,
        manifest: &ZiplineManifest,
        base_url: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let now_epoch_ms = self.now();
        let fetches = manifest.modules().iter().map(|(id, module)| async move {
            let request = FetchRequest {
                application_name,
                module_id: id,
                sha256: &module.sha256,
                now_epoch_ms,
                base_url,
                url: &module.url,
            };
            let bytes = chain
                .fetch(&request)
                .await?
                .ok_or_else(|| LoaderError::ModuleUnavailable { id: id.clone() })?;
            if Sha256::digest(&bytes).as_slice() != module.sha256.as_slice() {
                return Err(LoaderError::ChecksumMismatch { id: id.clone() });
            }
            Ok((id.clone(), bytes))
        });
        futures::future::try_join_all(fetches).await
    }

    async fn download_to(
        &self,
        application_name: &str,
        download_dir: &Path,
        manifest_url: Option<&str>,
        loaded: &LoadedManifest,
    ) -> Result<()> {
        self.verifier
            .verify(&loaded.manifest_bytes, &loaded.manifest)?;
        tokio::fs::create_dir_all(download_dir).await?;

        let http: Arc<dyn Fetcher> = self.http_fetcher();
        let chain = FetcherChain::new(vec![http], self.permits.clone(), self.listener.clone());
        let base_url = loaded.manifest.base_url().or(manifest_url);
        let modules = self
            .fetch_modules(application_name, &chain, &loaded.manifest, base_url)
            .await?;

        for (module, (_, bytes)) in loaded.manifest.modules().values().zip(&modules) {
            write_atomically(&download_dir.join(module.sha256_hex()), bytes).await?;
        }
        // Last, so a failed download never leaves a manifest behind that
        // names missing files.
        let manifest_path = download_dir.join(application_manifest_file_name(application_name));
        write_atomically(&manifest_path, &loaded.manifest_bytes).await?;

        tracing::info!(
            application = %application_name,
            path = %download_dir.display(),
            modules = modules.len(),
            "Application downloaded"
        );
        Ok(())
    }

    fn report(
        &self,
        application_name: &str,
        manifest_url: Option<&str>,
        result: Result<(Arc<Zipline>, LoadedManifest)>,
    ) -> LoadResult {
        match result {
            Ok((zipline, loaded)) => {
                tracing::info!(
                    application = %application_name,
                    modules = loaded.manifest.modules().len(),
                    "Application loaded"
                );
                self.listener
                    .application_load_success(application_name, manifest_url);
                LoadResult::Success {
                    zipline,
                    manifest: loaded.manifest,
                    fresh_at_epoch_ms: loaded.fresh_at_epoch_ms,
                }
            }
            Err(e) => {
                tracing::error!(application = %application_name, error = %e, "Application load failed");
                self.listener
                    .application_load_failed(application_name, manifest_url, &e);
                LoadResult::Failure(e)
            }
        }
    }

    fn module_fetchers(&self) -> FetcherChain {
        let http = self.http_fetcher();
        let mut fetchers: Vec<Arc<dyn Fetcher>> = Vec::new();
        if let Some(directory) = &self.embedded_directory {
            fetchers.push(Arc::new(EmbeddedFetcher::new(directory.clone())));
        }
        match &self.cache {
            Some(cache) => fetchers.push(Arc::new(CachingFetcher::new(cache.clone(), http))),
            None => fetchers.push(http),
        }
        FetcherChain::new(fetchers, self.permits.clone(), self.listener.clone())
    }

    fn http_fetcher(&self) -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(
            self.http_client.clone(),
            self.listener.clone(),
        ))
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }
}

/// Run the initializer, load every module in order, then call main.
fn start<I>(
    zipline: &Zipline,
    manifest: &ZiplineManifest,
    modules: &[(String, Vec<u8>)],
    initializer: &I,
) -> Result<()>
where
    I: Fn(&Zipline) -> zipline_bridge::Result<()>,
{
    initializer(zipline)?;
    for (id, bytes) in modules {
        zipline.load_module(bytes, id)?;
    }
    if !manifest.main_module_id().is_empty() && !manifest.main_function().is_empty() {
        zipline.call_main(manifest.main_module_id(), manifest.main_function())?;
    }
    Ok(())
}

fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
