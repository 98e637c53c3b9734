use thiserror::Error;

/// Everything that can go wrong inside the cache and autoupdate engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The underlying store holds no cache data. Raised by providers when
    /// the data was never built or was flushed externally; callers rebuild
    /// once and retry.
    #[error("the element cache is empty or was flushed")]
    CacheEmpty,

    /// The requested change id predates the oldest retained one; a diff can
    /// no longer be computed and the caller must fall back to full data.
    #[error("change id {requested} is not retained anymore (lowest is {lowest})")]
    ChangeIdTooLow { requested: u64, lowest: u64 },

    /// The requested change id lies in the future.
    #[error("change id {requested} is higher than the current change id {current}")]
    ChangeIdTooHigh { requested: u64, current: u64 },

    /// A rebuild was performed but the store reported empty again right
    /// after. Something external keeps wiping the store.
    #[error("the cache reported empty immediately after a rebuild")]
    RebuildFailed,

    #[error("malformed element id {0:?}")]
    MalformedElementId(String),

    #[error("an element of collection {collection:?} has no numeric 'id' field")]
    MissingElementId { collection: String },

    #[error("collection {0:?} is registered more than once")]
    DuplicateCollection(String),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(redis::RedisError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A failure inside a collaborator implementation (element source,
    /// permission service, history store).
    #[error(transparent)]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        // The ensure-prefix of the store scripts signals a wiped cache with
        // a custom error reply.
        if error.to_string().contains("cache_empty") {
            CacheError::CacheEmpty
        }
        else {
            CacheError::Redis(error)
        }
    }
}

impl CacheError {
    /// Wraps an arbitrary collaborator error.
    pub fn external<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::External(Box::new(error))
    }
}
