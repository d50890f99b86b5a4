use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::CacheError;

/// How deep below a search root a moved payload is looked for.
const MAX_SEARCH_DEPTH: usize = 8;

/// Identity of a file that survives renames on the same device.
///
/// Inode numbers are recycled once a file is freed, so the length and timestamps captured at
/// materialize time have to match as well before a file is taken to be the same payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub device: u64,
    pub inode: u64,
    #[serde(default)]
    pub len: u64,
    #[serde(default)]
    pub modified: Option<SystemTime>,
    #[serde(default)]
    pub created: Option<SystemTime>,
}

impl FileId {
    #[cfg(unix)]
    fn from_metadata(meta: &fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            device: meta.dev(),
            inode: meta.ino(),
            len: meta.len(),
            modified: meta.modified().ok(),
            created: meta.created().ok(),
        })
    }

    #[cfg(not(unix))]
    fn from_metadata(_meta: &fs::Metadata) -> Option<Self> {
        None
    }
}

/// Durable pointer to a cached payload.
///
/// Two references are equal only if they name the same path *and* the same file identity,
/// so a re-download written over the same path yields a different reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: PathBuf,
    #[serde(default)]
    pub file_id: Option<FileId>,
}

/// Turns paths into [`FileReference`]s and back.
pub trait ReferenceResolver: Send + Sync {
    /// Captures a reference to the file or directory at `path`.
    fn materialize(&self, path: &Path) -> Result<FileReference, CacheError>;

    /// Returns the current location of the referenced payload, or `None` if it is stale.
    ///
    /// Never touches the filesystem beyond reading metadata.
    fn resolve(&self, reference: &FileReference) -> Option<PathBuf>;

    /// Resolves a batch of references, in order.
    fn resolve_all(&self, references: &[&FileReference]) -> Vec<Option<PathBuf>> {
        references.iter().map(|r| self.resolve(r)).collect()
    }
}

/// Resolver backed by canonical paths plus file identity.
///
/// When the recorded path no longer holds the same file, the search roots are walked for an
/// entry with the recorded identity. This is what makes a reference tolerant to the payload (or
/// any of its parent directories) being renamed inside a root.
#[derive(Debug, Clone, Default)]
pub struct FsReferenceResolver {
    search_roots: Vec<PathBuf>,
}

impl FsReferenceResolver {
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        let search_roots = search_roots
            .into_iter()
            .map(|root| root.canonicalize().unwrap_or(root))
            .collect();
        Self { search_roots }
    }

    /// The recorded path, if it still holds the referenced file.
    fn at_recorded_path(reference: &FileReference) -> Option<PathBuf> {
        let meta = fs::metadata(&reference.path).ok()?;
        match reference.file_id {
            None => Some(reference.path.clone()),
            Some(id) if FileId::from_metadata(&meta) == Some(id) => Some(reference.path.clone()),
            Some(_) => None,
        }
    }

    /// Walks the search roots once, collecting the location of every wanted identity.
    fn search(&self, wanted: &HashSet<FileId>) -> HashMap<FileId, PathBuf> {
        let mut found = HashMap::new();
        if wanted.is_empty() {
            return found;
        }
        for root in &self.search_roots {
            let walker = WalkDir::new(root)
                .follow_links(false)
                .max_depth(MAX_SEARCH_DEPTH);
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::debug!(%err, root = %root.display(), "skipping entry during reference search");
                        continue;
                    }
                };
                let Some(id) = entry.metadata().ok().and_then(|m| FileId::from_metadata(&m)) else {
                    continue;
                };
                if wanted.contains(&id) && !found.contains_key(&id) {
                    found.insert(id, entry.into_path());
                    if found.len() == wanted.len() {
                        return found;
                    }
                }
            }
        }
        found
    }
}

impl ReferenceResolver for FsReferenceResolver {
    fn materialize(&self, path: &Path) -> Result<FileReference, CacheError> {
        let capture = || -> io::Result<FileReference> {
            let path = path.canonicalize()?;
            let meta = fs::metadata(&path)?;
            Ok(FileReference {
                file_id: FileId::from_metadata(&meta),
                path,
            })
        };
        capture().map_err(|source| CacheError::ReferenceCreation {
            path: path.to_path_buf(),
            source,
        })
    }

    fn resolve(&self, reference: &FileReference) -> Option<PathBuf> {
        self.resolve_all(&[reference]).pop().flatten()
    }

    fn resolve_all(&self, references: &[&FileReference]) -> Vec<Option<PathBuf>> {
        let mut resolved: Vec<Option<PathBuf>> =
            references.iter().map(|r| Self::at_recorded_path(r)).collect();

        let wanted: HashSet<FileId> = references
            .iter()
            .zip(&resolved)
            .filter(|(_, path)| path.is_none())
            .filter_map(|(r, _)| r.file_id)
            .collect();
        let found = self.search(&wanted);

        for (reference, slot) in references.iter().zip(resolved.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            *slot = reference.file_id.and_then(|id| found.get(&id).cloned());
            if slot.is_none() {
                tracing::debug!(path = %reference.path.display(), "file reference is stale");
            }
        }
        resolved
    }
}
