use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FileReference, DEFAULT_MAX_SIZE};
use crate::error::CacheError;

/// Metadata of one cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub uri: String,
    pub file_reference: FileReference,
    /// Size attributed at store time, never recomputed.
    pub byte_size: u64,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheRecord {
    /// Creates a record whose access time is its creation time.
    pub fn new(uri: impl Into<String>, file_reference: FileReference, byte_size: u64) -> Self {
        Self {
            uri: uri.into(),
            file_reference,
            byte_size,
            last_accessed_at: Utc::now(),
        }
    }
}

fn default_max_size() -> u64 {
    DEFAULT_MAX_SIZE
}

/// The persisted cache state.
///
/// `current_size` is always the sum of `byte_size` over `records`. Every mutation goes through
/// a method that adjusts both together, which is why the fields are private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
    #[serde(default)]
    records: Vec<CacheRecord>,
    #[serde(default)]
    current_size: u64,
    #[serde(default = "default_max_size")]
    max_size: u64,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl CacheIndex {
    pub fn new(max_size: u64) -> Self {
        Self {
            records: Vec::new(),
            current_size: 0,
            max_size,
        }
    }

    /// Decodes a persisted index.
    ///
    /// A blob whose `current_size` disagrees with its records is repaired from the records.
    pub fn from_slice(data: &[u8]) -> Result<Self, CacheError> {
        let mut index: CacheIndex = serde_json::from_slice(data)?;
        let actual = index.records.iter().map(|r| r.byte_size).sum::<u64>();
        if actual != index.current_size {
            tracing::warn!(
                persisted = index.current_size,
                actual,
                "cache index size out of sync, repairing"
            );
            index.current_size = actual;
        }
        Ok(index)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn records(&self) -> &[CacheRecord] {
        &self.records
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record stored under `uri`.
    pub fn find(&self, uri: &str) -> Option<&CacheRecord> {
        self.records.iter().find(|r| r.uri == uri)
    }

    /// All records stored under `uri`.
    pub fn records_for<'a>(&'a self, uri: &'a str) -> impl Iterator<Item = &'a CacheRecord> + 'a {
        self.records.iter().filter(move |r| r.uri == uri)
    }

    /// Distinct uris in insertion order.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = Vec::with_capacity(self.records.len());
        for record in &self.records {
            if !uris.contains(&record.uri) {
                uris.push(record.uri.clone());
            }
        }
        uris
    }

    /// Appends `record` without looking for existing records under the same uri.
    pub fn add_record(&mut self, record: CacheRecord) {
        self.current_size = self.current_size.saturating_add(record.byte_size);
        self.records.push(record);
    }

    /// Removes every record matching `predicate` and returns them.
    pub fn remove_records<F>(&mut self, mut predicate: F) -> Vec<CacheRecord>
    where
        F: FnMut(&CacheRecord) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.records.drain(..).partition(|r| predicate(r));
        self.records = kept;

        let freed = removed.iter().map(|r| r.byte_size).sum::<u64>();
        self.current_size = self.current_size.saturating_sub(freed);
        removed
    }

    /// Updates the access time of the first record under `uri`. Returns whether one was found.
    pub fn touch_record(&mut self, uri: &str, when: DateTime<Utc>) -> bool {
        match self.records.iter_mut().find(|r| r.uri == uri) {
            Some(record) => {
                record.last_accessed_at = when;
                true
            }
            None => false,
        }
    }

    /// Replaces the ceiling. Evicting down to it is up to the caller.
    pub fn set_max_size(&mut self, max_size: u64) {
        self.max_size = max_size;
    }
}
