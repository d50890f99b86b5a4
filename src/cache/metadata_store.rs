use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

/// A single durable slot holding the serialized cache index.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Returns the stored blob, or `None` if nothing was saved yet.
    async fn load(&self) -> io::Result<Option<Bytes>>;

    /// Replaces the stored blob.
    async fn save(&self, data: &[u8]) -> io::Result<()>;
}

/// Stores the blob in a file named after the SHA-256 of its key.
pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub async fn new(dir: &Path, key: &str) -> io::Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
        }
        Ok(Self {
            path: dir.join(Self::file_name(key)),
        })
    }

    fn file_name(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{}.json", hex::encode(hasher.finalize()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn load(&self) -> io::Result<Option<Bytes>> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, data: &[u8]) -> io::Result<()> {
        // 先写临时文件再重命名，避免留下半截的索引
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await
    }
}

/// In-memory slot, used where nothing needs to outlive the process.
#[derive(Default)]
pub struct MemoryMetadataStore {
    slot: Mutex<Option<Bytes>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load(&self) -> io::Result<Option<Bytes>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, data: &[u8]) -> io::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(Bytes::copy_from_slice(data));
        Ok(())
    }
}
