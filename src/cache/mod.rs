mod controller;
mod eviction;
mod index;
mod metadata_store;
mod reference;
mod size;

pub use controller::*;
pub use eviction::*;
pub use index::*;
pub use metadata_store::*;
pub use reference::*;
pub use size::*;

pub const DEFAULT_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024; // 2GB
pub const CACHE_DIR: &str = "video_cache";
/// Key of the single slot the index is persisted under.
pub const INDEX_KEY: &str = "video_cache_index";
