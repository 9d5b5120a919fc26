//! Bounded worker pool for parallel fan-out.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::ConfigError;

/// Runs futures on a tokio runtime with at most `size` of them executing at
/// once. Work beyond the limit waits for a permit instead of being rejected.
///
/// Nested parallel constructs draw from the same pool: a branch that fans out
/// again holds its permit while its own branches wait for one, so deeply
/// nested parallel routes need a pool larger than their nesting depth.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool that spawns onto `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroLimit`] if `size` is zero.
    pub fn new(handle: Handle, size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroLimit {
                what: "worker pool size",
            });
        }
        Ok(Self {
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    /// Creates a pool on the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoRuntime`] outside a tokio runtime, or
    /// [`ConfigError::ZeroLimit`] if `size` is zero.
    pub fn current(size: usize) -> Result<Self, ConfigError> {
        let handle = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        Self::new(handle, size)
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of permits not currently held by running work.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `fut`; it starts running once a permit is free.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            // The semaphore is never closed, so acquisition only fails if it is.
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        })
    }
}
