//! Expiration manager
//!
//! Tracks leases behind the barrier and revokes them when they expire.
//! Restoration happens at startup (post-unseal), the sweep loop runs
//! until pre-seal stops it, and the lease counter feeds the metrics
//! emitter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contracts::StorageView;
use crate::error::Result;
use crate::lifecycle::WorkerHandle;

/// Storage prefix for lease entries, relative to the barrier root
pub const LEASE_PREFIX: &str = "sys/expire/";

/// One tracked lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEntry {
    /// Lease id
    pub id: String,
    /// Path the lease was issued against
    pub path: String,
    /// Unix timestamp after which the lease is revoked
    pub expire_time: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lease tracking and revocation
pub struct ExpirationManager {
    view: StorageView,
    lease_count: AtomicUsize,
    worker: Mutex<Option<WorkerHandle>>,
}

impl ExpirationManager {
    /// Restore persisted leases and start the sweep loop
    pub async fn start(view: StorageView, sweep_interval: Duration) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            view,
            lease_count: AtomicUsize::new(0),
            worker: Mutex::new(None),
        });

        let restored = manager.view.list("").await?.len();
        manager.lease_count.store(restored, Ordering::SeqCst);
        info!("expiration manager restored {} leases", restored);

        let sweeper = Arc::clone(&manager);
        let handle = WorkerHandle::spawn(move |mut stop| async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = sweeper.sweep().await {
                            warn!("expiration sweep failed: {}", e);
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        });
        *manager.worker.lock().await = Some(handle);

        Ok(manager)
    }

    /// Stop the sweep loop; lease state stays behind the barrier
    pub async fn stop(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.stop().await;
        }
        debug!("expiration manager stopped");
    }

    /// Register a lease with the given time-to-live
    pub async fn register(&self, path: &str, ttl: Duration) -> Result<String> {
        let lease = LeaseEntry {
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            expire_time: now_secs() + ttl.as_secs(),
        };
        self.view
            .put(&lease.id, serde_json::to_vec(&lease)?)
            .await?;
        self.lease_count.fetch_add(1, Ordering::SeqCst);
        Ok(lease.id)
    }

    /// Revoke a lease immediately
    pub async fn revoke(&self, id: &str) -> Result<()> {
        if self.view.get(id).await?.is_some() {
            self.view.delete(id).await?;
            self.lease_count.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.lease_count.load(Ordering::SeqCst)
    }

    /// Revoke every lease whose expiry has passed
    async fn sweep(&self) -> Result<()> {
        let now = now_secs();
        let mut revoked = 0usize;
        for id in self.view.list("").await? {
            let Some(entry) = self.view.get(&id).await? else {
                continue;
            };
            let lease: LeaseEntry = serde_json::from_slice(&entry.value)?;
            if lease.expire_time <= now {
                self.view.delete(&id).await?;
                self.lease_count.fetch_sub(1, Ordering::SeqCst);
                revoked += 1;
            }
        }
        if revoked > 0 {
            debug!("expiration sweep revoked {} leases", revoked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::physical::InmemBackend;
    use palisade_core::{AesGcmBarrier, Backend};

    async fn view() -> StorageView {
        let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
        let barrier = Arc::new(AesGcmBarrier::new(backend));
        let master = AesGcmBarrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        StorageView::new(barrier, LEASE_PREFIX)
    }

    #[tokio::test]
    async fn test_register_revoke_and_count() {
        let manager = ExpirationManager::start(view().await, Duration::from_secs(60))
            .await
            .unwrap();

        let id = manager.register("kv/creds", Duration::from_secs(300)).await.unwrap();
        assert_eq!(manager.lease_count(), 1);

        manager.revoke(&id).await.unwrap();
        assert_eq!(manager.lease_count(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_revokes_expired_leases() {
        let manager = ExpirationManager::start(view().await, Duration::from_millis(20))
            .await
            .unwrap();

        manager.register("kv/expired", Duration::from_secs(0)).await.unwrap();
        manager.register("kv/live", Duration::from_secs(600)).await.unwrap();
        assert_eq!(manager.lease_count(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.lease_count(), 1);
        manager.stop().await;
    }
}
