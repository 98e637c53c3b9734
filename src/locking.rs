use std::{collections::HashSet, sync::Mutex};

use async_trait::async_trait;

use crate::error::CacheError;

/// A cooperative lock shared by all workers of a deployment. Used to make
/// sure only one process rebuilds the cache at a time.
///
/// This is advisory locking: holders are expected to release, and waiters
/// poll [`is_held`](Self::is_held).
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    /// Tries to take the named lock. Returns `false` when someone else holds
    /// it.
    async fn try_acquire(&self, name: &str) -> Result<bool, CacheError>;

    async fn release(&self, name: &str) -> Result<(), CacheError>;

    async fn is_held(&self, name: &str) -> Result<bool, CacheError>;
}

/// Process-local locks for single-worker setups and tests.
#[derive(Debug, Default)]
pub struct MemoryLockProvider {
    held: Mutex<HashSet<String>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.lock().insert(name.to_owned()))
    }

    async fn release(&self, name: &str) -> Result<(), CacheError> {
        self.lock().remove(name);
        Ok(())
    }

    async fn is_held(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.lock().contains(name))
    }
}

/// Deployment-wide locks on redis keys, taken with `SET NX`.
#[cfg(feature = "redis")]
pub struct RedisLockProvider {
    manager: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisLockProvider {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub fn with_manager(manager: redis::aio::ConnectionManager) -> Self {
        Self { manager }
    }

    fn key(name: &str) -> String {
        format!("lock:{name}")
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn try_acquire(&self, name: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(1)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(acquired)
    }

    async fn release(&self, name: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = redis::AsyncCommands::del(&mut conn, Self::key(name)).await?;
        Ok(())
    }

    async fn is_held(&self, name: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        Ok(redis::AsyncCommands::exists(&mut conn, Self::key(name)).await?)
    }
}
