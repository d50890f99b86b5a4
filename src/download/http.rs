use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::Downloader;
use crate::error::DownloadError;

// 默认超时时间（10秒）：等待响应头，以及响应体两帧之间的最长间隔
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloads plain `http://` sources into a local directory.
///
/// Each payload lands at `<dir>/<sha256(uri)>[.ext]`. The body is streamed to a `.part` file
/// first and renamed once complete, so a returned path always holds a whole payload.
pub struct HttpDownloader {
    client: Client<HttpConnector, Empty<Bytes>>,
    download_dir: PathBuf,
    timeout: Duration,
    in_flight: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl HttpDownloader {
    pub fn new(download_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            download_dir: download_dir.into(),
            timeout,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn target_path(&self, uri: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        let mut name = hex::encode(hasher.finalize());

        // 保留原始扩展名，方便播放器识别格式
        let ext = url::Url::parse(uri).ok().and_then(|url| {
            Path::new(url.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_owned)
        });
        if let Some(ext) = ext {
            name.push('.');
            name.push_str(&ext);
        }
        self.download_dir.join(name)
    }

    /// Tracks a new download of `uri`, superseding any earlier one still in flight.
    fn register(&self, uri: &str) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = in_flight.insert(uri.to_owned(), (id, token.clone())) {
            previous.cancel();
        }
        (id, token)
    }

    fn unregister(&self, uri: &str, id: u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(uri).is_some_and(|(current, _)| *current == id) {
            in_flight.remove(uri);
        }
    }

    async fn fetch_to(&self, uri: &str, part_path: &Path) -> Result<u64, DownloadError> {
        let parsed: Uri = uri
            .parse()
            .map_err(|_| DownloadError::InvalidUri(uri.to_owned()))?;

        let response = tokio::time::timeout(self.timeout, self.client.get(parsed))
            .await
            .map_err(|_| DownloadError::Timeout)??;
        let status = response.status();
        if !(status.is_success() || status == StatusCode::PARTIAL_CONTENT) {
            return Err(DownloadError::Http(status));
        }

        let mut file = fs::File::create(part_path).await?;
        let mut body = response.into_body();
        let mut bytes_received = 0u64;
        // 只限制空闲时间，大文件的整体传输时间不受限
        while let Some(frame) = tokio::time::timeout(self.timeout, body.frame())
            .await
            .map_err(|_| DownloadError::Timeout)?
        {
            let frame = frame?;
            if let Ok(chunk) = frame.into_data() {
                bytes_received += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
        }
        file.flush().await?;
        Ok(bytes_received)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, uri: &str) -> Result<PathBuf, DownloadError> {
        fs::create_dir_all(&self.download_dir).await?;
        let target = self.target_path(uri);
        let part_path = target.with_extension("part");

        let (id, token) = self.register(uri);
        let result = tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            res = self.fetch_to(uri, &part_path) => res,
        };
        self.unregister(uri, id);

        match result {
            Ok(bytes) => {
                fs::rename(&part_path, &target).await?;
                tracing::info!(%uri, bytes, path = %target.display(), "download complete");
                Ok(target)
            }
            Err(err) => {
                if let Err(e) = fs::remove_file(&part_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(error = %e, path = %part_path.display(), "failed to remove partial download");
                    }
                }
                tracing::warn!(%uri, error = %err, "download failed");
                Err(err)
            }
        }
    }

    fn cancel_download(&self, uri: &str) {
        let token = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uri);
        if let Some((_, token)) = token {
            tracing::debug!(%uri, "cancelling download");
            token.cancel();
        }
    }
}
