use std::fs;
use std::path::Path;

use walkdir::WalkDir;

/// Bytes attributed to a payload: the file length, or the summed length of every regular file
/// below it for a directory payload. Unreadable payloads count as `0`.
pub fn payload_size(path: &Path) -> u64 {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "failed to read payload metadata");
            return 0;
        }
    };
    if meta.is_dir() {
        directory_size(path)
    } else {
        meta.len()
    }
}

fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(%err, "skipping entry while sizing directory");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
