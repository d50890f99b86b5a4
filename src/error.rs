use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures inside the cache.
///
/// None of these cross the [`VideoCache`](crate::cache::VideoCache) boundary: the controller
/// logs them and reports a cache miss (or nothing) to its caller.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A durable reference could not be captured for a freshly stored payload.
    #[error("failed to create file reference for `{}`", path.display())]
    ReferenceCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A stored reference no longer points at a live file.
    #[error("file reference for `{0}` is stale")]
    StaleReference(String),
    /// Removing a cached payload from disk failed.
    #[error("failed to delete `{}`: {source}", path.display())]
    Deletion {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("metadata store I/O failed")]
    Persistence(#[from] io::Error),
    #[error("malformed cache index")]
    Serialization(#[from] serde_json::Error),
    /// The ceiling must be strictly positive.
    #[error("invalid cache capacity: {0}")]
    InvalidCapacity(u64),
}

/// Errors reported by a [`Downloader`](crate::download::Downloader).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("source responded with {0}")]
    Http(hyper::StatusCode),
    #[error("network error: {0}")]
    Network(String),
    #[error("download timed out")]
    Timeout,
    #[error("download was cancelled")]
    Cancelled,
    #[error("failed to write download: {0}")]
    Io(#[from] io::Error),
}

impl From<hyper::Error> for DownloadError {
    fn from(err: hyper::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for DownloadError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}
