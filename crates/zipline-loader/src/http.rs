use std::future::Future;
use std::pin::Pin;

use crate::error::LoaderError;

/// Facade over the HTTP stack used to download manifests and modules.
///
/// Implementations can use `reqwest` or serve canned bytes for testing.
pub trait ZiplineHttpClient: Send + Sync {
    fn download<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, LoaderError>> + Send + 'a>>;
}

pub struct ReqwestHttpClient {
    http: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ZiplineHttpClient for ReqwestHttpClient {
    fn download<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, LoaderError>> + Send + 'a>> {
        Box::pin(async move {
            let http_error = |message: String| LoaderError::Http {
                url: url.to_string(),
                message,
            };

            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| http_error(format!("HTTP request failed: {e}")))?;

            if !resp.status().is_success() {
                return Err(http_error(format!("server returned {}", resp.status())));
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| http_error(format!("failed to read response body: {e}")))?;
            Ok(body.to_vec())
        })
    }
}

/// Resolve a module `link` against the manifest's base URL.
///
/// Links that are already absolute, or that can't be resolved, are returned
/// unchanged.
pub fn resolve_url(base_url: Option<&str>, link: &str) -> String {
    let Some(base) = base_url.and_then(|base| reqwest::Url::parse(base).ok()) else {
        return link.to_string();
    };
    match base.join(link) {
        Ok(url) => url.to_string(),
        Err(_) => link.to_string(),
    }
}
