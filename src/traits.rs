use async_trait::async_trait;

use crate::{
    element::{FullData, UserId},
    error::CacheError,
};

/// A source of cacheable elements for one collection.
///
/// Implementations typically wrap a database table or an ORM queryset. The
/// cache calls `elements` once per (re)build and `elements_by_ids` whenever
/// an autoupdate bundle carries elements without inline data.
#[async_trait]
pub trait Cachable: Send + Sync + 'static {
    /// The collection string, e.g. `"motions/motion"`. Must be unique and
    /// stable for the lifetime of the process.
    fn collection(&self) -> &str;

    /// Config-like collections are written in the first build phase so that
    /// other sources can read settings while the rest of the cache is still
    /// being filled.
    fn is_config(&self) -> bool {
        false
    }

    /// Personalized collections produce different data per viewer by design;
    /// an element disappearing from a viewer's restricted view is never
    /// reported as a deletion.
    fn personalized(&self) -> bool {
        false
    }

    /// When `true`, all elements of this collection behave as if they carried
    /// the per-element restriction marker.
    fn no_delete_on_restriction(&self) -> bool {
        false
    }

    /// All current elements of the collection, unrestricted.
    async fn elements(&self) -> Result<Vec<FullData>, CacheError>;

    /// The elements with the given ids. Ids without a matching element are
    /// simply absent from the result; the caller treats them as deleted.
    async fn elements_by_ids(&self, ids: &[u64]) -> Result<Vec<FullData>, CacheError>;

    /// Reduces elements to what the given viewer may see. Implementations
    /// may drop whole elements, drop fields, or swap in alternative
    /// per-viewer content. `None` means an unrestricted internal caller and
    /// never reaches this method.
    ///
    /// The default is full visibility.
    async fn restrict_elements(
        &self,
        user_id: Option<UserId>,
        elements: Vec<FullData>,
    ) -> Result<Vec<FullData>, CacheError> {
        let _ = user_id;
        Ok(elements)
    }
}

/// One history record, written before a bundle is committed to the cache.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub element_id:  String,
    pub information: Vec<String>,
    pub user_id:     Option<UserId>,
    /// The element's full data at the time of the change; `None` for
    /// deletions.
    pub full_data:   Option<FullData>,
}

/// Persists history entries. Failures are logged by the dispatcher and never
/// abort the cache commit.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    async fn save(&self, entries: Vec<HistoryEntry>) -> Result<(), CacheError>;
}

/// A history store that records nothing.
#[derive(Debug, Default)]
pub struct NoHistory;

#[async_trait]
impl HistoryStore for NoHistory {
    async fn save(&self, _entries: Vec<HistoryEntry>) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Answers permission questions for restriction policies.
#[async_trait]
pub trait PermissionService: Send + Sync + 'static {
    /// Whether the viewer holds the given permission. `None` is the
    /// unrestricted internal caller and always holds every permission.
    async fn has_perm(&self, user_id: Option<UserId>, permission: &str) -> Result<bool, CacheError>;

    /// The group ids of the viewer, for group-based restriction policies.
    async fn user_groups(&self, user_id: Option<UserId>) -> Result<Vec<u64>, CacheError>;
}
