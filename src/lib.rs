//! Persistent, size-bounded disk cache for downloaded videos.
//!
//! [`cache::VideoCache`] keeps an index of cached payloads keyed by source uri, evicts the least
//! recently used ones once the configured ceiling is reached, and survives restarts by
//! persisting the index through a [`cache::MetadataStore`].

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
