//! Fetchers produce a module's bytes from wherever they can: files shipped
//! with the host, the local cache, or the network.

mod cache;
mod embedded;
mod http;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use zipline_bridge::EventListener;

use crate::error::{LoaderError, Result};

pub use cache::CachingFetcher;
pub use embedded::EmbeddedFetcher;
pub use http::HttpFetcher;

/// Everything a fetcher may need to find one module.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub application_name: &'a str,
    pub module_id: &'a str,
    pub sha256: &'a [u8],
    pub now_epoch_ms: u64,
    /// What relative module URLs resolve against.
    pub base_url: Option<&'a str>,
    pub url: &'a str,
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send + 'a>>;

pub trait Fetcher: Send + Sync {
    /// Reported in fetch events.
    fn name(&self) -> &'static str;

    /// The module's bytes, `None` if this fetcher doesn't have them, or an
    /// error if it should have had them but failed.
    fn fetch<'a>(&'a self, request: &'a FetchRequest<'a>) -> FetchFuture<'a>;
}

/// Fetchers tried in order, with a bound on how many modules are fetched at
/// once.
#[derive(Clone)]
pub struct FetcherChain {
    fetchers: Vec<Arc<dyn Fetcher>>,
    permits: Arc<Semaphore>,
    listener: Arc<dyn EventListener>,
}

impl FetcherChain {
    pub fn new(
        fetchers: Vec<Arc<dyn Fetcher>>,
        permits: Arc<Semaphore>,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            fetchers,
            permits,
            listener,
        }
    }

    /// The first fetcher that has the module wins.
    ///
    /// A failing fetcher doesn't stop the chain. If no fetcher has the module
    /// the first failure is returned, or `None` if nothing failed.
    pub async fn fetch(&self, request: &FetchRequest<'_>) -> Result<Option<Vec<u8>>> {
        let application = request.application_name;
        let module_id = request.module_id;

        self.listener
            .module_fetch_permit_acquire_start(application, module_id);
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LoaderError::ModuleUnavailable {
                id: module_id.to_string(),
            })?;
        self.listener
            .module_fetch_permit_acquire_end(application, module_id);

        let mut first_error = None;
        for fetcher in &self.fetchers {
            let name = fetcher.name();
            self.listener.module_fetch_start(application, module_id, name);
            match fetcher.fetch(request).await {
                Ok(Some(bytes)) => {
                    self.listener
                        .module_fetch_end(application, module_id, name, true);
                    tracing::debug!(application, module_id, fetcher = name, "Module fetched");
                    return Ok(Some(bytes));
                }
                Ok(None) => {
                    self.listener
                        .module_fetch_end(application, module_id, name, false);
                }
                Err(e) => {
                    tracing::warn!(application, module_id, fetcher = name, error = %e, "Fetcher failed");
                    self.listener
                        .module_fetch_failed(application, module_id, name, &e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use zipline_testing::LoggingEventListener;

    /// Answers with a fixed outcome and counts calls.
    struct Scripted {
        name: &'static str,
        outcome: fn(&str) -> Result<Option<Vec<u8>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(name: &'static str, outcome: fn(&str) -> Result<Option<Vec<u8>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Fetcher for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fetch<'a>(&'a self, request: &'a FetchRequest<'a>) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(request.module_id.to_string());
                (self.outcome)(request.module_id)
            })
        }
    }

    fn request(module_id: &str) -> FetchRequest<'_> {
        FetchRequest {
            application_name: "red",
            module_id,
            sha256: &[],
            now_epoch_ms: 0,
            base_url: None,
            url: "alpha.zipline",
        }
    }

    fn chain(fetchers: Vec<Arc<Scripted>>, listener: Arc<LoggingEventListener>) -> FetcherChain {
        let fetchers = fetchers
            .into_iter()
            .map(|fetcher| fetcher as Arc<dyn Fetcher>)
            .collect();
        FetcherChain::new(fetchers, Arc::new(Semaphore::new(3)), listener)
    }

    fn missing(_: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn found(id: &str) -> Result<Option<Vec<u8>>> {
        Ok(Some(id.as_bytes().to_vec()))
    }

    fn broken(id: &str) -> Result<Option<Vec<u8>>> {
        Err(LoaderError::ModuleUnavailable { id: id.to_string() })
    }

    fn checksum(id: &str) -> Result<Option<Vec<u8>>> {
        Err(LoaderError::ChecksumMismatch { id: id.to_string() })
    }

    #[tokio::test]
    async fn first_hit_wins() {
        let listener = Arc::new(LoggingEventListener::new().with_fetch_events());
        let embedded = Scripted::new("embedded", missing);
        let cache = Scripted::new("cache", found);
        let http = Scripted::new("http", found);
        let chain = chain(vec![embedded.clone(), cache.clone(), http.clone()], listener.clone());

        let bytes = chain.fetch(&request("alpha")).await.unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"alpha"[..]));
        assert!(http.calls().is_empty());
        assert_eq!(
            listener.take_all(),
            [
                "moduleFetchPermitAcquireStart red alpha",
                "moduleFetchPermitAcquireEnd red alpha",
                "moduleFetchStart red alpha embedded",
                "moduleFetchEnd red alpha embedded false",
                "moduleFetchStart red alpha cache",
                "moduleFetchEnd red alpha cache true",
            ]
        );
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_chain() {
        let listener = Arc::new(LoggingEventListener::new());
        let chain = chain(
            vec![Scripted::new("cache", broken), Scripted::new("http", found)],
            listener,
        );

        let bytes = chain.fetch(&request("alpha")).await.unwrap();
        assert_eq!(bytes, Some(b"alpha".to_vec()));
    }

    #[tokio::test]
    async fn first_failure_is_reported() {
        let listener = Arc::new(LoggingEventListener::new());
        let chain = chain(
            vec![
                Scripted::new("embedded", missing),
                Scripted::new("cache", checksum),
                Scripted::new("http", broken),
            ],
            listener.clone(),
        );

        let error = chain.fetch(&request("bravo")).await.unwrap_err();
        assert_eq!(error.to_string(), "checksum mismatch for bravo");
        assert_eq!(
            listener.take_exception().as_deref(),
            Some("no fetcher could provide module bravo")
        );
    }

    #[tokio::test]
    async fn nobody_has_it() {
        let listener = Arc::new(LoggingEventListener::new());
        let chain = chain(vec![Scripted::new("embedded", missing)], listener);
        assert_eq!(chain.fetch(&request("alpha")).await.unwrap(), None);
    }
}
