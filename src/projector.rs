use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{cache::ElementCache, element::FullData, error::CacheError};

/// Rendered slide data per projector id.
pub type ProjectorData = BTreeMap<u64, Vec<FullData>>;

/// Published on the projector channel after every committed bundle.
#[derive(Debug, Clone)]
pub struct ProjectorUpdate {
    /// The change id the data is current as of.
    pub change_id: u64,
    pub data:      ProjectorData,
}

/// Renders the current projector slides from cache contents. Slide
/// composition is application logic; the dispatcher only owns the "after
/// every commit" trigger and the fan-out.
#[async_trait]
pub trait ProjectorResolver: Send + Sync + 'static {
    async fn projector_data(&self, cache: &ElementCache) -> Result<ProjectorData, CacheError>;
}
