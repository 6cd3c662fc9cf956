//! Operation Guard (spec §4.4): a bounded semaphore fronting the
//! Block-Device Manager, with an injected pre-operation health check run
//! only once a permit is held.

use std::sync::Arc;

use blockdev::PoolManager;
use log::info;
use pipeline_api::error::ManagerError;
use tokio::sync::Semaphore;

use crate::health_check;

pub struct OperationGuard {
    semaphore: Arc<Semaphore>,
    pool: Arc<PoolManager>,
}

impl OperationGuard {
    pub fn new(pool: Arc<PoolManager>, permits: usize) -> Self {
        OperationGuard {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            pool,
        }
    }

    /// Acquires a permit, runs the health check, and only on success
    /// invokes `operation`. The permit is released on every exit path
    /// (including the health check failing or `operation` erroring).
    pub async fn with_operation<T, F>(&self, name: &str, operation: F) -> Result<T, ManagerError>
    where
        F: FnOnce() -> Result<T, ManagerError>,
    {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return Err(ManagerError::new(pipeline_api::error::SafeguardError::PermitTimeout));
        };

        info!("operation-guard: acquired permit for '{name}'");
        health_check::run(&self.pool)?;
        operation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_released_after_health_check_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PoolManager::new("guard-test-pool", dir.path(), 4 * 1024 * 1024, 64 * 1024 * 1024));
        let guard = OperationGuard::new(pool, 1);

        let result: Result<(), ManagerError> = guard.with_operation("noop", || Ok(())).await;
        assert!(result.is_err());

        // The permit must have been released even though the health check
        // failed; a second call should still be able to acquire it.
        let result: Result<(), ManagerError> = guard.with_operation("noop", || Ok(())).await;
        assert!(result.is_err());
    }
}
