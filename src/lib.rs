//! # plenum-sync
//!
//! Real-time element cache and autoupdate distribution engine for assembly
//! and council applications.
//!
//! Connected clients hold a full copy of the data they may see and keep it
//! current through small patches ("autoupdates") instead of polling. This
//! crate is the server-side machinery behind that:
//!
//! - The **element cache** ([`ElementCache`]) holds the authoritative,
//!   JSON-serialized state of every element, shared by all workers through a
//!   [`CacheProvider`] (process-local or redis-backed).
//! - Every committed mutation gets a strictly growing **change id**; a
//!   sorted index of change ids lets the cache answer "everything since
//!   change id N" cheaply.
//! - Mutations are collected into an [`AutoupdateBundle`] and committed
//!   atomically; the [`AutoupdateDispatcher`] resolves missing data from the
//!   element sources, writes history and fans the new change id out to all
//!   subscribed connections.
//! - Each client is driven by an [`AutoupdateConnection`], which computes
//!   per-viewer restricted diffs, coalesces bursts of changes and falls back
//!   to a transparent full resync when a diff is not answerable anymore.
//!
//! The application plugs in through a handful of traits: [`Cachable`] for
//! each collection of elements, [`HistoryStore`], [`PermissionService`],
//! [`ProjectorResolver`] and the transport-side [`AutoupdateSink`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use plenum_sync::prelude::*;
//!
//! # #[derive(Debug)] struct Motions;
//! # #[async_trait::async_trait]
//! # impl Cachable for Motions {
//! #     fn collection(&self) -> &str { "motions/motion" }
//! #     async fn elements(&self) -> Result<Vec<FullData>, CacheError> { Ok(vec![]) }
//! #     async fn elements_by_ids(&self, _: &[u64]) -> Result<Vec<FullData>, CacheError> { Ok(vec![]) }
//! # }
//! # async fn demo() -> Result<(), CacheError> {
//! let registry = Arc::new(CachableRegistry::new([
//!     Arc::new(Motions) as Arc<dyn Cachable>,
//! ])?);
//! let cache = Arc::new(ElementCache::in_memory(registry));
//! cache.ensure_cache(false).await?;
//!
//! let dispatcher = Arc::new(AutoupdateDispatcher::new(
//!     Arc::clone(&cache),
//!     Arc::new(NoHistory),
//! ));
//!
//! let mut bundle = dispatcher.bundle();
//! bundle.add([AutoupdateElement::new("motions/motion", 1)]);
//! let change_id = bundle.done().await?;
//! # let _ = change_id;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod cache;
pub mod connection;
pub mod element;
pub mod error;
pub mod locking;
pub mod projector;
pub mod provider;
pub mod registry;
pub mod restrict;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[doc(inline)]
pub use bundle::{AutoupdateBundle, AutoupdateDispatcher, AutoupdateElement};
#[doc(inline)]
pub use cache::ElementCache;
#[doc(inline)]
pub use connection::AutoupdateConnection;
#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use traits::Cachable;

pub mod prelude {
    pub use crate::bundle::{
        AutoupdateBundle, AutoupdateDispatcher, AutoupdateElement, ChangeNotification, ElementData,
    };
    pub use crate::cache::ElementCache;
    pub use crate::connection::{AutoupdateConnection, AutoupdatePayload, AutoupdateSink};
    pub use crate::element::{element_id, FullData, UserId};
    pub use crate::error::CacheError;
    pub use crate::locking::{LockProvider, MemoryLockProvider};
    pub use crate::projector::{ProjectorData, ProjectorResolver, ProjectorUpdate};
    pub use crate::provider::{CacheProvider, MemoryCacheProvider};
    pub use crate::registry::CachableRegistry;
    pub use crate::traits::{Cachable, HistoryEntry, HistoryStore, NoHistory, PermissionService};
}
