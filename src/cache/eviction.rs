use super::{CacheIndex, CacheRecord};

/// Share of the ceiling freed on top of the overflow whenever a purge runs.
const PURGE_FRACTION_DIVISOR: u64 = 5; // 20%

/// Number of bytes a purge aims to free: 20% of the ceiling plus whatever is over it.
pub fn purge_target(current_size: u64, max_size: u64) -> u64 {
    let overflow = current_size.saturating_sub(max_size);
    max_size / PURGE_FRACTION_DIVISOR + overflow
}

/// Picks the uris to evict, least recently accessed first.
///
/// Returns nothing while the cache is below its ceiling. Otherwise records are taken in
/// ascending access order (insertion order breaks ties) for as long as the bytes selected so far
/// are still short of the purge target, so the last pick may overshoot it.
pub fn eviction_candidates(index: &CacheIndex) -> Vec<String> {
    let current_size = index.current_size();
    let max_size = index.max_size();
    if current_size < max_size {
        return Vec::new();
    }

    let mut by_access: Vec<&CacheRecord> = index.records().iter().collect();
    by_access.sort_by_key(|r| r.last_accessed_at);

    let target = purge_target(current_size, max_size);
    let mut selected = 0u64;
    let mut candidates = Vec::new();
    for record in by_access {
        if selected >= target {
            break;
        }
        selected = selected.saturating_add(record.byte_size);
        candidates.push(record.uri.clone());
    }

    tracing::debug!(
        current_size,
        max_size,
        target,
        selected,
        count = candidates.len(),
        "selected eviction candidates"
    );
    candidates
}
