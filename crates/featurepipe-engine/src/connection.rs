//! Warehouse connection lifecycle: bounded pool, retrying acquisition and
//! scoped release.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use featurepipe_warehouse::{
    ConnectOptions, MemoryWarehouse, SqliteWarehouse, Warehouse, WarehouseConnection,
    WarehouseError,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{WarehouseBackend, WarehouseConfig};
use crate::error::ConnectionError;

/// Bounded exponential backoff for connection acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &WarehouseConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Hands out warehouse connections, at most `max_connections` at a time.
///
/// Callers beyond the bound wait for a permit rather than failing. Clones
/// share the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    warehouse: Arc<dyn Warehouse>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    busy_timeout: Duration,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, max_connections: usize, retry: RetryPolicy) -> Self {
        Self {
            warehouse,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            retry,
            busy_timeout: ConnectOptions::default().busy_timeout,
        }
    }

    #[must_use]
    pub fn from_config(warehouse: Arc<dyn Warehouse>, config: &WarehouseConfig) -> Self {
        let mut manager = Self::new(
            warehouse,
            config.max_connections,
            RetryPolicy::from_config(config),
        );
        manager.busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        manager
    }

    #[must_use]
    pub fn warehouse_name(&self) -> &str {
        self.warehouse.name()
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a pool slot, then connect, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Exhausted`] once every attempt failed
    /// transiently, or [`ConnectionError::Refused`] on a non-transient error.
    pub async fn acquire(&self, client_name: &str) -> Result<ConnectionGuard, ConnectionError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConnectionError::PoolClosed)?;

        let options = ConnectOptions {
            client_name: client_name.to_string(),
            busy_timeout: self.busy_timeout,
        };
        let max_attempts = self.retry.max_attempts;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.warehouse.connect(&options).await {
                Ok(conn) => {
                    tracing::debug!(
                        warehouse = self.warehouse.name(),
                        attempt,
                        "Warehouse connection acquired"
                    );
                    return Ok(ConnectionGuard {
                        conn: Some(conn),
                        permit: Some(permit),
                    });
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    tracing::warn!(
                        warehouse = self.warehouse.name(),
                        attempt,
                        max_attempts,
                        delay_ms,
                        error = %err,
                        "Transient connection failure, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    tracing::error!(
                        warehouse = self.warehouse.name(),
                        attempt,
                        error = %err,
                        "Connection attempts exhausted"
                    );
                    return Err(ConnectionError::Exhausted {
                        warehouse: self.warehouse.name().to_string(),
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    tracing::error!(
                        warehouse = self.warehouse.name(),
                        error = %err,
                        "Non-transient connection failure"
                    );
                    return Err(ConnectionError::Refused {
                        warehouse: self.warehouse.name().to_string(),
                        error: err,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("warehouse", &self.warehouse.name())
            .field("available", &self.permits.available_permits())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// An acquired connection plus its pool slot.
///
/// [`release`](Self::release) disconnects and frees the slot; it is
/// idempotent and never fails. A guard dropped without release still frees
/// its slot.
pub struct ConnectionGuard {
    conn: Option<Box<dyn WarehouseConnection>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl ConnectionGuard {
    /// The live connection.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Closed`] after release.
    pub fn connection(&mut self) -> Result<&mut dyn WarehouseConnection, WarehouseError> {
        match self.conn.as_mut() {
            Some(conn) => Ok(conn.as_mut()),
            None => Err(WarehouseError::Closed),
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Disconnect and return the pool slot. Errors are logged, not raised.
    pub async fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(err) = conn.disconnect().await {
                tracing::warn!(error = %err, "Warehouse disconnect failed; connection dropped");
            }
        }
        self.permit.take();
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::warn!("Connection guard dropped without release");
        }
    }
}

/// Build the warehouse a pipeline's config points at. The `SQLite` file is
/// created lazily on first connect.
#[must_use]
pub fn open_warehouse(config: &WarehouseConfig) -> Arc<dyn Warehouse> {
    match config.backend {
        WarehouseBackend::Sqlite => {
            let path = if let Some(path) = &config.path {
                PathBuf::from(path)
            } else {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".featurepipe").join("warehouse.db")
            };
            tracing::debug!(path = %path.display(), "Using SQLite warehouse");
            Arc::new(SqliteWarehouse::open(path))
        }
        WarehouseBackend::Memory => Arc::new(MemoryWarehouse::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use featurepipe_warehouse::FaultPlan;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(10), Duration::from_secs(30));
        assert_eq!(p.delay_for(100), Duration::from_secs(30));
    }

    #[test]
    fn test_policy_from_config() {
        let p = RetryPolicy::from_config(&WarehouseConfig::default());
        assert_eq!(p, policy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_transient_failures() {
        let wh = MemoryWarehouse::new();
        wh.set_faults(FaultPlan {
            transient_connect_failures: 2,
            ..FaultPlan::default()
        });
        let manager = ConnectionManager::new(Arc::new(wh.clone()), 1, policy());

        let started = tokio::time::Instant::now();
        let mut guard = manager.acquire("test").await.unwrap();
        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(wh.stats().connect_attempts, 3);
        guard.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_max_attempts() {
        let wh = MemoryWarehouse::new();
        wh.set_faults(FaultPlan {
            transient_connect_failures: 5,
            ..FaultPlan::default()
        });
        let manager = ConnectionManager::new(Arc::new(wh.clone()), 1, policy());
        let err = manager.acquire("test").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Exhausted { attempts: 3, .. }));
        assert_eq!(wh.stats().connect_attempts, 3);
        // The pool slot was returned.
        assert_eq!(manager.available(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let wh = MemoryWarehouse::new();
        wh.set_faults(FaultPlan {
            refuse_connections: true,
            ..FaultPlan::default()
        });
        let manager = ConnectionManager::new(Arc::new(wh.clone()), 1, policy());
        let err = manager.acquire("test").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Refused { .. }));
        assert_eq!(wh.stats().connect_attempts, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_frees_slot() {
        let wh = MemoryWarehouse::new();
        let manager = ConnectionManager::new(Arc::new(wh.clone()), 1, policy());
        let mut guard = manager.acquire("test").await.unwrap();
        assert_eq!(manager.available(), 0);
        guard.release().await;
        guard.release().await;
        assert!(guard.is_released());
        assert!(guard.connection().is_err());
        assert_eq!(manager.available(), 1);
        assert_eq!(wh.stats().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bound_applies_backpressure() {
        let wh = MemoryWarehouse::new();
        let manager = ConnectionManager::new(Arc::new(wh.clone()), 1, policy());
        let mut first = manager.acquire("a").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut guard = manager.acquire("b").await.unwrap();
                guard.release().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(wh.stats().connect_attempts, 1);

        first.release().await;
        waiter.await.unwrap();
        assert_eq!(wh.stats().peak_open_connections, 1);
    }

    #[test]
    fn test_open_memory_warehouse() {
        let config = WarehouseConfig {
            backend: WarehouseBackend::Memory,
            ..WarehouseConfig::default()
        };
        assert_eq!(open_warehouse(&config).name(), "memory");
    }
}
