pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::CacheError;

pub use memory::MemoryCacheProvider;
#[cfg(feature = "redis")]
pub use redis::RedisCacheProvider;

/// The result of a diff read: everything that changed after a given change
/// id, as raw JSON strings grouped by collection, plus the element ids that
/// were deleted in that window.
#[derive(Debug, Default)]
pub struct DataSince {
    pub max_change_id: u64,
    pub changed:       BTreeMap<String, Vec<String>>,
    pub deleted:       Vec<String>,
}

/// The low-level store behind the element cache.
///
/// Elements are stored as JSON strings keyed by element id, next to a change
/// id index that records which element ids were touched at which change id.
/// Every operation that combines reads and writes is atomic with respect to
/// concurrent callers, including callers in other processes for networked
/// implementations.
///
/// Read operations and [`apply_changes`](Self::apply_changes) raise
/// [`CacheError::CacheEmpty`] when the store holds no cache, so that the
/// caller can rebuild and retry.
#[async_trait]
pub trait CacheProvider: Send + Sync + 'static {
    /// Removes all cache data, including the ready flag and the change id
    /// index.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Atomically replaces the whole cache with `data` and resets the change
    /// id index to a single lowest entry at `default_change_id`. Clears the
    /// ready flag.
    async fn reset_full_cache(
        &self,
        data: BTreeMap<String, String>,
        default_change_id: u64,
    ) -> Result<(), CacheError>;

    /// Writes elements without touching the change id index. Used for the
    /// second build phase.
    async fn bulk_write(&self, data: BTreeMap<String, String>) -> Result<(), CacheError>;

    async fn mark_ready(&self) -> Result<(), CacheError>;

    async fn is_ready(&self) -> Result<bool, CacheError>;

    /// All elements, keyed by element id.
    async fn get_all(&self) -> Result<BTreeMap<String, String>, CacheError>;

    /// All elements together with the change id they are current as of, read
    /// atomically.
    async fn get_all_with_max_change_id(
        &self,
    ) -> Result<(u64, BTreeMap<String, String>), CacheError>;

    /// All elements of one collection, keyed by numeric id.
    async fn get_collection(&self, collection: &str) -> Result<BTreeMap<u64, String>, CacheError>;

    async fn get_one(&self, element_id: &str) -> Result<Option<String>, CacheError>;

    /// Atomically writes changed elements, deletes removed ones, assigns the
    /// next change id to all of them and returns it.
    async fn apply_changes(
        &self,
        changed: Vec<(String, String)>,
        deleted: Vec<String>,
    ) -> Result<u64, CacheError>;

    /// Everything that changed at change ids `>= change_id`, plus the current
    /// maximum change id, read atomically. An element that was changed and
    /// later deleted within the window appears only as deleted.
    async fn get_data_since(&self, change_id: u64) -> Result<DataSince, CacheError>;

    /// The highest assigned change id. At least the lowest one, right after
    /// a build.
    async fn current_change_id(&self) -> Result<u64, CacheError>;

    /// The change id recorded at the last full build. Diffs are only
    /// answerable strictly above it.
    async fn lowest_change_id(&self) -> Result<u64, CacheError>;
}
