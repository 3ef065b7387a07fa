use std::sync::Arc;

use super::{FetchFuture, FetchRequest, Fetcher, HttpFetcher};
use crate::cache::ZiplineCache;

/// Serves modules from the cache, downloading and storing the ones it is
/// missing.
pub struct CachingFetcher {
    cache: Arc<ZiplineCache>,
    delegate: Arc<HttpFetcher>,
}

impl CachingFetcher {
    pub fn new(cache: Arc<ZiplineCache>, delegate: Arc<HttpFetcher>) -> Self {
        Self { cache, delegate }
    }
}

impl Fetcher for CachingFetcher {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn fetch<'a>(&'a self, request: &'a FetchRequest<'a>) -> FetchFuture<'a> {
        Box::pin(async move {
            let key = hex::encode(request.sha256);
            self.cache
                .get_or_put(&key, request.now_epoch_ms, || self.delegate.fetch(request))
                .await
        })
    }
}
