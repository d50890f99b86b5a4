mod http;

pub use http::*;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::DownloadError;

/// Fetches source media to a local path the cache can take over.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Downloads `uri` and returns where the completed payload was written.
    async fn download(&self, uri: &str) -> Result<PathBuf, DownloadError>;

    /// Best-effort abort of an in-flight download of `uri`.
    fn cancel_download(&self, uri: &str);
}
