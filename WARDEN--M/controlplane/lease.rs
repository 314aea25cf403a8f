//! Time-bounded mutual exclusion used to pick a single active poller.

use std::{sync::Arc, time::Duration};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kv::{KvStore, StoreError};

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lock key.
    pub key: String,
    /// Token proving ownership; only the holder can renew or release.
    pub holder_token: String,
    /// Lifetime granted by each acquire or renewal.
    pub ttl: Duration,
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller now holds the lease.
    Acquired(Lease),
    /// Another holder owns a live lease.
    Busy,
}

/// Lease lock over an atomic key-value backend.
#[derive(Clone)]
pub struct LeaseLock {
    kv: Arc<dyn KvStore>,
}

impl LeaseLock {
    /// Wraps a key-value backend.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Attempts to take `key` for `ttl`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LeaseOutcome, StoreError> {
        let token = Uuid::new_v4().to_string();
        if self.kv.set_if_absent(key, &token, ttl).await? {
            debug!(key, "lease acquired");
            Ok(LeaseOutcome::Acquired(Lease {
                key: key.to_string(),
                holder_token: token,
                ttl,
            }))
        } else {
            Ok(LeaseOutcome::Busy)
        }
    }

    /// Extends the lease by its ttl. Returns `false` if it was lost.
    pub async fn renew(&self, lease: &Lease) -> Result<bool, StoreError> {
        self.kv
            .expire_if_equals(&lease.key, &lease.holder_token, lease.ttl)
            .await
    }

    /// Releases the lease if still held by `lease.holder_token`.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.kv.delete_if_equals(key, token).await
    }

    /// Acquires `key` and starts a heartbeat that renews it every `ttl / 3`.
    pub async fn acquire_guarded(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>, StoreError> {
        match self.acquire(key, ttl).await? {
            LeaseOutcome::Busy => Ok(None),
            LeaseOutcome::Acquired(lease) => {
                let heartbeat = tokio::spawn(heartbeat(self.clone(), lease.clone()));
                Ok(Some(LeaseGuard {
                    lock: self.clone(),
                    lease: Some(lease),
                    heartbeat: Some(heartbeat),
                }))
            }
        }
    }
}

async fn heartbeat(lock: LeaseLock, lease: Lease) {
    let period = (lease.ttl / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match lock.renew(&lease).await {
            Ok(true) => debug!(key = %lease.key, "lease renewed"),
            Ok(false) => {
                warn!(key = %lease.key, "lease lost before renewal; heartbeat stopped");
                break;
            }
            Err(err) => {
                warn!(key = %lease.key, error = %err, "lease renewal failed; heartbeat stopped");
                break;
            }
        }
    }
}

/// Held lease with a running heartbeat.
///
/// Call [`LeaseGuard::release`] when the cycle ends. Dropping the guard stops the
/// heartbeat and schedules a best-effort release on the current runtime.
pub struct LeaseGuard {
    lock: LeaseLock,
    lease: Option<Lease>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    /// The held lease.
    #[must_use]
    pub const fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Stops the heartbeat and releases the lease.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        let Some(lease) = self.lease.take() else {
            return Ok(false);
        };
        let released = self.lock.release(&lease.key, &lease.holder_token).await?;
        info!(key = %lease.key, released, "lease released");
        Ok(released)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(lease) = self.lease.take() {
            if let Ok(runtime) = Handle::try_current() {
                let lock = self.lock.clone();
                runtime.spawn(async move {
                    if let Err(err) = lock.release(&lease.key, &lease.holder_token).await {
                        warn!(key = %lease.key, error = %err, "deferred lease release failed");
                    }
                });
            }
        }
    }
}
