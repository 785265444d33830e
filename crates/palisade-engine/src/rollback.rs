//! Rollback manager
//!
//! Periodically ticks every mounted backend so partially-applied
//! operations get cleaned up. Started late in post-unseal and stopped
//! during pre-seal, before the mounts it ticks are unloaded.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::contracts::EngineBackend;
use crate::lifecycle::WorkerHandle;

/// Drives periodic rollback passes over the mounted backends
pub struct RollbackManager {
    handle: WorkerHandle,
}

impl RollbackManager {
    /// Start the rollback loop over `mounts`
    pub fn start(mounts: Vec<(String, Arc<dyn EngineBackend>)>, period: Duration) -> Self {
        let handle = WorkerHandle::spawn(move |mut stop| async move {
            let mut tick = tokio::time::interval(period);
            // The first interval tick fires immediately; skip it so a
            // fresh activation does not roll back before serving
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for (path, backend) in &mounts {
                            if let Err(e) = backend.rollback().await {
                                warn!("rollback failed for mount {}: {}", path, e);
                            }
                        }
                        debug!("rollback pass complete over {} mounts", mounts.len());
                    }
                    _ = stop.changed() => return,
                }
            }
        });
        Self { handle }
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        rollbacks: AtomicUsize,
    }

    #[async_trait]
    impl EngineBackend for CountingEngine {
        async fn rollback(&self) -> Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollback_ticks_each_mount() {
        let engine = Arc::new(CountingEngine {
            rollbacks: AtomicUsize::new(0),
        });
        let manager = RollbackManager::start(
            vec![("kv/".to_string(), Arc::clone(&engine) as Arc<dyn EngineBackend>)],
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.stop().await;

        assert!(engine.rollbacks.load(Ordering::SeqCst) >= 2);
    }
}
