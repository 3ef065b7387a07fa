use std::sync::Arc;

use sha2::{Digest, Sha256};
use zipline_bridge::EventListener;

use super::{FetchFuture, FetchRequest, Fetcher};
use crate::error::{LoaderError, Result};
use crate::http::{ZiplineHttpClient, resolve_url};

/// Downloads modules and manifests, reporting download events.
pub struct HttpFetcher {
    client: Arc<dyn ZiplineHttpClient>,
    listener: Arc<dyn EventListener>,
}

impl HttpFetcher {
    pub fn new(client: Arc<dyn ZiplineHttpClient>, listener: Arc<dyn EventListener>) -> Self {
        Self { client, listener }
    }

    /// Download `url` as-is.
    pub async fn download(&self, application_name: &str, url: &str) -> Result<Vec<u8>> {
        self.listener.download_start(application_name, url);
        match self.client.download(url).await {
            Ok(bytes) => {
                self.listener.download_end(application_name, url);
                tracing::debug!(application = %application_name, url, size = bytes.len(), "Downloaded");
                Ok(bytes)
            }
            Err(e) => {
                tracing::warn!(application = %application_name, url, error = %e, "Download failed");
                self.listener.download_failed(application_name, url, &e);
                Err(e)
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch<'a>(&'a self, request: &'a FetchRequest<'a>) -> FetchFuture<'a> {
        Box::pin(async move {
            let url = resolve_url(request.base_url, request.url);
            let bytes = self.download(request.application_name, &url).await?;
            if Sha256::digest(&bytes).as_slice() != request.sha256 {
                return Err(LoaderError::ChecksumMismatch {
                    id: request.module_id.to_string(),
                });
            }
            Ok(Some(bytes))
        })
    }
}
