use std::path::PathBuf;

use super::{FetchFuture, FetchRequest, Fetcher};

/// Reads modules shipped alongside the host, stored as
/// `<directory>/<sha256 hex>`.
pub struct EmbeddedFetcher {
    directory: PathBuf,
}

impl EmbeddedFetcher {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl Fetcher for EmbeddedFetcher {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn fetch<'a>(&'a self, request: &'a FetchRequest<'a>) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = self.directory.join(hex::encode(request.sha256));
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}
