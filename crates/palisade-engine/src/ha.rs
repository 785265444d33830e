//! HA lock coordination and periodic workers
//!
//! The standby loop races for the backend lock, and on a win performs
//! leader setup in a fixed order: wipe cached seal state, catch up on
//! key upgrades, mint a fresh cluster identity, advertise, then run
//! post-unseal. Losing the lock (or a stop/step-down signal) runs the
//! teardown mirror and loops back to contention. At most one
//! activation is live at any time, and a loss mid-setup still tears
//! down cleanly.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use palisade_core::{Entry, Lock, UPGRADE_PREFIX};

use crate::cluster::ClusterIdentity;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::expiration::ExpirationManager;
use crate::lifecycle::WorkerHandle;

/// Path used to acquire the coordinating lock for an HA deployment
pub const CORE_LOCK_PATH: &str = "core/lock";

/// A non-empty value here tells standbys their cached keyring is stale
/// and they must seal and restart the unseal handshake
pub const POISON_PILL_PATH: &str = "core/poison-pill";

/// Prefix of the per-leader advertisement entries
pub const LEADER_PREFIX: &str = "core/leader/";

/// Canary written by a synchronous rekey so replicated clusters pick it
/// up; consumed by the replication layer, not by this engine
pub const KEYRING_CANARY_PATH: &str = "core/canary-keyring";

impl Core {
    /// The standby loop. Runs from unseal until shutdown or seal on an
    /// HA-enabled core; owns the transitions between standby and
    /// active.
    pub(crate) async fn run_standby(
        self: Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
        done_tx: oneshot::Sender<()>,
        mut manual_rx: mpsc::Receiver<()>,
    ) {
        info!("entering standby mode");

        let key_upgrade_worker = {
            let core = Arc::clone(&self);
            WorkerHandle::spawn(move |stop| async move {
                core.periodic_check_key_upgrade(stop).await;
            })
        };
        let leader_refresh_worker = {
            let core = Arc::clone(&self);
            WorkerHandle::spawn(move |stop| async move {
                core.periodic_leader_refresh(stop).await;
            })
        };

        let Some(ha) = self.ha.as_ref().map(Arc::clone) else {
            // The loop is only spawned on HA-enabled cores
            key_upgrade_worker.stop().await;
            leader_refresh_worker.stop().await;
            let _ = done_tx.send(());
            return;
        };

        loop {
            if *stop_rx.borrow() {
                break;
            }

            // A fresh uuid per attempt; standbys key their caches off it
            let leader_uuid = Uuid::new_v4().to_string();
            let mut lock = match ha.lock_with(CORE_LOCK_PATH, &leader_uuid) {
                Ok(lock) => lock,
                Err(e) => {
                    error!("failed to create lock: {}", e);
                    break;
                }
            };

            let Some(mut leader_lost) = self.acquire_lock(lock.as_mut(), stop_rx.clone()).await
            else {
                break;
            };
            info!("acquired lock, enabling active operation");

            let mut state = self.state.write().await;

            // Wipe cached seal state and verify barrier sanity. A
            // corrupt keyring is fatal for this node.
            self.seal.clear_cached_configs().await;
            if let Err(e) = self.perform_key_upgrades().await {
                error!("error performing key upgrades: {}", e);
                drop(state);
                let _ = lock.unlock().await;
                let core = Arc::clone(&self);
                tokio::spawn(async move {
                    let _ = core.shutdown().await;
                });
                break;
            }

            // The uuid changed, so standbys know to re-fetch identity
            *self.cluster_identity.write().await = None;
            let setup = self.setup_cluster_identity().await;
            if let Err(e) = setup {
                drop(state);
                error!("cluster setup failed: {}", e);
                let _ = lock.unlock().await;
                continue;
            }

            if let Err(e) = self.advertise_leader(&leader_uuid, leader_lost.clone()).await {
                drop(state);
                error!("leader advertisement setup failed: {}", e);
                let _ = lock.unlock().await;
                continue;
            }

            let post = self.post_unseal(&mut state).await;
            if post.is_ok() {
                state.standby = false;
                self.metrics.set_standby(false);
            }
            drop(state);

            if let Err(e) = post {
                error!("post-unseal setup failed: {}", e);
                let _ = lock.unlock().await;
                continue;
            }

            // Monitor for a loss of leadership
            let mut manual_step_down = false;
            tokio::select! {
                _ = leader_lost.changed() => {
                    warn!("leadership lost, stopping active operation");
                }
                _ = stop_rx.changed() => {
                    warn!("stopping active operation");
                }
                step = manual_rx.recv() => {
                    if step.is_some() {
                        warn!("stepping down from active operation to standby");
                        manual_step_down = true;
                    } else {
                        warn!("stopping active operation");
                    }
                }
            }

            // Clear ourselves as leader before giving up the lock, so a
            // standby never reads our advertisement after the lock is
            // free
            if let Err(e) = self.clear_leader(&leader_uuid).await {
                error!("clearing leader advertisement failed: {}", e);
            }

            self.cancel_active_scope().await;

            let mut state = self.state.write().await;
            state.standby = true;
            self.metrics.set_standby(true);
            let teardown = self.pre_seal(&mut state).await;
            drop(state);
            if let Err(e) = teardown {
                error!("pre-seal teardown failed: {}", e);
            }

            let _ = lock.unlock().await;

            // After a manual step-down we could instantly re-grab the
            // lock; give the other nodes a chance
            if manual_step_down {
                tokio::time::sleep(self.timings.manual_step_down_sleep_period).await;
            }
        }

        key_upgrade_worker.stop().await;
        leader_refresh_worker.stop().await;
        debug!("standby loop exited");
        let _ = done_tx.send(());
    }

    /// Block until the backend lock is acquired, retrying on error.
    /// Returns `None` when interrupted by the stop channel.
    async fn acquire_lock(
        &self,
        lock: &mut dyn Lock,
        stop: watch::Receiver<bool>,
    ) -> Option<watch::Receiver<bool>> {
        loop {
            if *stop.borrow() {
                return None;
            }
            match lock.lock(stop.clone()).await {
                Ok(Some(leader_lost)) => return Some(leader_lost),
                Ok(None) => return None,
                Err(e) => {
                    error!("failed to acquire lock: {}", e);
                    let mut stop_wait = stop.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.timings.lock_retry_interval) => {}
                        _ = stop_wait.changed() => return None,
                    }
                }
            }
        }
    }

    /// Mint this epoch's cluster identity
    async fn setup_cluster_identity(&self) -> Result<()> {
        self.setup_cluster_info().await?;
        let identity = ClusterIdentity::generate()?;
        *self.cluster_identity.write().await = Some(identity);
        Ok(())
    }

    /// Write the leader advertisement and sweep stale siblings
    async fn advertise_leader(
        self: &Arc<Self>,
        uuid: &str,
        leader_lost: watch::Receiver<bool>,
    ) -> Result<()> {
        {
            let core = Arc::clone(self);
            let uuid = uuid.to_string();
            tokio::spawn(async move {
                core.clean_leader_prefix(&uuid, leader_lost).await;
            });
        }

        let identity = self.cluster_identity.read().await;
        let Some(identity) = identity.as_ref() else {
            error!("no cluster identity available to advertise");
            return Err(Error::Internal);
        };
        let adv = identity.advertisement(&self.redirect_addr, &self.cluster_addr);
        let value = adv.encode()?;
        self.barrier
            .put(Entry::new(format!("{}{}", LEADER_PREFIX, uuid), value))
            .await?;

        self.notify_active_state(true).await;
        Ok(())
    }

    /// Delete advertisements left behind by previous leaders, spaced
    /// out to avoid slamming the backend; aborts if leadership is lost
    async fn clean_leader_prefix(&self, uuid: &str, mut leader_lost: watch::Receiver<bool>) {
        let keys = match self.barrier.list(LEADER_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("failed to list entries in core/leader: {}", e);
                return;
            }
        };

        for key in keys {
            if key == uuid {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.timings.leader_prefix_clean_delay) => {
                    if let Err(e) = self
                        .barrier
                        .delete(&format!("{}{}", LEADER_PREFIX, key))
                        .await
                    {
                        error!("failed to delete stale leader entry {}: {}", key, e);
                    }
                }
                _ = leader_lost.changed() => return,
            }
        }
    }

    /// Delete our own advertisement and advertise standby status
    async fn clear_leader(&self, uuid: &str) -> Result<()> {
        let result = self
            .barrier
            .delete(&format!("{}{}", LEADER_PREFIX, uuid))
            .await;
        self.notify_active_state(false).await;
        Ok(result?)
    }

    /// Standby worker: re-evaluate the cached leader so request
    /// forwarding switches to a new active node quickly. `leader()`
    /// already avoids re-parsing an unchanged advertisement, so the
    /// result is simply dropped.
    async fn periodic_leader_refresh(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.timings.leader_check_interval) => {
                    let _ = self.leader().await;
                }
                _ = stop.changed() => return,
            }
        }
    }

    /// Standby worker: watch the poison pill and walk pending key-term
    /// upgrades
    async fn periodic_check_key_upgrade(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.timings.key_rotate_check_interval) => {
                    let standby = self.state.read().await.standby;
                    if !standby {
                        continue;
                    }

                    // A readable poison pill means our cached keys are
                    // stale (e.g. replication was activated); seal and
                    // force a fresh unseal handshake
                    if let Ok(Some(entry)) = self.barrier.get(POISON_PILL_PATH).await {
                        if !entry.value.is_empty() {
                            warn!(
                                "encryption keys have changed out from underneath us, must be unsealed again"
                            );
                            let core = Arc::clone(&self);
                            tokio::spawn(async move {
                                let _ = core.shutdown().await;
                            });
                            continue;
                        }
                    }

                    if let Err(e) = self.check_key_upgrades().await {
                        error!("key rotation periodic upgrade check failed: {}", e);
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }

    /// Active worker: refresh the expiration gauges every tick, under
    /// the mutex that sequences emission against sealing
    pub(crate) fn start_metrics_worker(
        self: &Arc<Self>,
        expiration: Option<Arc<ExpirationManager>>,
    ) -> WorkerHandle {
        let core = Arc::clone(self);
        let interval = self.timings.metrics_interval;
        WorkerHandle::spawn(move |mut stop| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let _guard = core.metrics_lock.lock().await;
                        if let Some(expiration) = &expiration {
                            core.metrics.set_lease_count(expiration.lease_count());
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        })
    }

    /// Walk the upgrade chain until no pending term remains
    pub(crate) async fn check_key_upgrades(&self) -> Result<()> {
        loop {
            let (did_upgrade, new_term) = self.barrier.check_upgrade().await?;
            if !did_upgrade {
                break;
            }
            info!("upgraded to new key term {}", new_term);
        }
        Ok(())
    }

    /// Leader-takeover catch-up: apply pending upgrades, reload the
    /// master key and keyring a previous leader may have rewritten, and
    /// schedule the upgrade-chain sweep
    pub(crate) async fn perform_key_upgrades(self: &Arc<Self>) -> Result<()> {
        self.check_key_upgrades().await?;
        self.barrier.reload_master_key().await?;
        self.barrier.reload_keyring().await?;
        self.schedule_upgrade_cleanup().await?;
        Ok(())
    }

    /// After the grace period, delete every upgrade entry at or below
    /// the active term; skipped entirely if the barrier was resealed in
    /// the meantime
    pub(crate) async fn schedule_upgrade_cleanup(self: &Arc<Self>) -> Result<()> {
        let upgrades = self.barrier.list(UPGRADE_PREFIX).await?;
        if upgrades.is_empty() {
            return Ok(());
        }

        let core = Arc::clone(self);
        let grace = self.timings.key_rotate_grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            if core.barrier.sealed().await {
                warn!("barrier sealed at upgrade cleanup time");
                return;
            }
            let active_term = match core.barrier.active_term().await {
                Ok(term) => term,
                Err(_) => return,
            };

            for upgrade in upgrades {
                let Ok(term) = upgrade.parse::<u32>() else {
                    continue;
                };
                if term <= active_term {
                    if let Err(e) = core.barrier.destroy_upgrade(term).await {
                        error!("failed to clean up upgrade for term {}: {}", term, e);
                    }
                }
            }
            debug!("upgrade chain cleanup complete");
        });
        Ok(())
    }
}
