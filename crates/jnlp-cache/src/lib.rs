//! Disk-backed, multi-process LRU cache for resources downloaded by a JNLP launcher.
//!
//! Several launcher processes may share one cache root; they coordinate only through
//! advisory file locks on the shared files.
//!
//! ## On-disk layout
//!
//! Under `<cache_root>/`:
//! - `recently_used`:
//!   - the LRU index, a `.properties` file (see [`LruCacheIndex`])
//! - `<id>/<protocol>/<host>[:port]/<path...>`:
//!   - one numbered directory per cached resource; the numbered directory is the unit
//!     of eviction
//!   - each artifact has an `<artifact>.info` sibling holding its [`CacheEntry`]
//!     metadata
//!
//! Next to the root, `instance.lock` is held (shared) by running launchers; see
//! [`RunningInstanceLock`] and [`ResourceCache::ok_to_clear_cache`].
//!
//! The crate only emits `tracing` events (target `jnlp.cache`); installing a
//! subscriber is left to the application, e.g. with [`LoggingConfig::env_filter`].

mod cache;
mod config;
mod directory;
mod entry;
mod error;
mod holder;
mod ids;
mod index;
mod layout;
mod lock;
mod resource;
mod util;
mod version;

pub use cache::{
    CacheCleanFailure, CacheCleanReport, ClearCacheGuard, EvictedEntry, EvictionReason,
    ResourceCache,
};
pub use config::{
    CacheConfig, CacheSizeLimit, LoggingConfig, DEFAULT_INDEX_FILE_NAME,
    DEFAULT_MAIN_LOCK_FILE_NAME,
};
pub use directory::{CacheDirectory, DirectoryNode};
pub use entry::CacheEntry;
pub use error::{CacheError, ConfigError, Result};
pub use holder::LruCacheIndexHolder;
pub use ids::{CacheFileRow, CacheId, CacheIdKind};
pub use index::{convert_properties_to_entries, IndexEntry, LruCacheIndex};
pub use layout::{
    cache_file_for_info, info_file_for, is_cacheable, url_to_relative_path, CacheLayout,
    INFO_SUFFIX,
};
pub use lock::{CacheLock, RunningInstanceLock};
pub use resource::{CacheKey, ResourceInfo};
pub use util::now_millis;
pub use version::{VersionId, VersionString};
