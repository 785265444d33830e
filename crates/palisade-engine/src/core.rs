//! The Core: seal/unseal state machine and operator surface
//!
//! The core owns the barrier, the seal, the unlock assembler, and the
//! lifecycle of every dependent subsystem. One reader/writer state lock
//! guards all mutable core state; transitions (unseal, seal,
//! activation) take it for writing, request-path observers take it for
//! reading. Subsidiary locks (leader cache, cluster identity, rekey
//! progress, forwarding parameters, metrics) are always acquired after
//! the state lock, never before it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};
use zeroize::Zeroizing;

use palisade_core::{shamir, AesGcmBarrier, Backend, HaBackend};

use crate::cluster::{self, ClusterIdentity, ClusterInfo, ForwardingParams, LeaderAdvertisement};
use crate::config::{CoreConfig, Timings};
use crate::contracts::{
    AuditFactory, AuthBroker, EngineFactory, LifecycleHook, PassthroughFactory, Request,
    StaticRootBroker,
};
use crate::error::{Error, Result};
use crate::ha::{CORE_LOCK_PATH, LEADER_PREFIX};
use crate::lifecycle::Subsystems;
use crate::metrics::CoreMetrics;
use crate::seal::{Seal, SealConfig, ShamirSeal};
use crate::unlock::{SubmitOutcome, UnlockSession};

/// Cached identity of the observed leader; refreshed only when the
/// leader uuid changes
#[derive(Default)]
pub(crate) struct LeaderCache {
    pub uuid: String,
    pub redirect_addr: String,
    pub cluster_addr: String,
}

/// In-flight rekey attempts; cleared by pre-seal
#[derive(Default)]
pub(crate) struct RekeyProgress {
    pub barrier: Option<RekeyState>,
    pub recovery: Option<RekeyState>,
}

/// One pending rekey operation: the configuration it will install plus
/// the share-collection session proving knowledge of the current key
pub struct RekeyState {
    /// The configuration the rekey will install
    pub config: SealConfig,
    pub(crate) session: UnlockSession,
}

impl RekeyState {
    /// Start an attempt; the session nonce becomes the operation nonce
    pub(crate) fn new(mut config: SealConfig) -> Self {
        let session = UnlockSession::new();
        config.nonce = session.nonce().to_string();
        Self { config, session }
    }
}

/// Mutable core state behind the state lock
pub(crate) struct CoreState {
    pub sealed: bool,
    pub standby: bool,
    pub unlock: Option<UnlockSession>,
    pub active_scope: Option<watch::Sender<bool>>,
    pub standby_stop: Option<watch::Sender<bool>>,
    pub standby_done: Option<oneshot::Receiver<()>>,
    pub manual_step_down: Option<mpsc::Sender<()>>,
    pub subsystems: Subsystems,
}

impl CoreState {
    fn new() -> Self {
        Self {
            sealed: true,
            standby: true,
            unlock: None,
            active_scope: None,
            standby_stop: None,
            standby_done: None,
            manual_step_down: None,
            subsystems: Subsystems::default(),
        }
    }
}

/// The central manager of the secrets service
pub struct Core {
    pub(crate) physical: Arc<dyn Backend>,
    pub(crate) ha: Option<Arc<dyn HaBackend>>,
    pub(crate) barrier: Arc<AesGcmBarrier>,
    pub(crate) seal: Arc<dyn Seal>,
    pub(crate) auth: Arc<dyn AuthBroker>,

    pub(crate) redirect_addr: String,
    pub(crate) cluster_addr: String,
    pub(crate) cluster_name: String,
    pub(crate) disable_cache: bool,

    pub(crate) engine_factories: HashMap<String, Arc<dyn EngineFactory>>,
    pub(crate) credential_factories: HashMap<String, Arc<dyn EngineFactory>>,
    pub(crate) audit_factories: HashMap<String, Arc<dyn AuditFactory>>,
    pub(crate) hooks: Vec<Arc<dyn LifecycleHook>>,
    pub(crate) timings: Timings,
    pub(crate) metrics: CoreMetrics,

    pub(crate) state: RwLock<CoreState>,
    pub(crate) leader_cache: RwLock<LeaderCache>,
    pub(crate) cluster_identity: RwLock<Option<ClusterIdentity>>,
    pub(crate) cluster_info: RwLock<Option<ClusterInfo>>,
    pub(crate) forwarding: RwLock<Option<ForwardingParams>>,
    pub(crate) rekey: RwLock<RekeyProgress>,
    pub(crate) metrics_lock: Mutex<()>,
}

impl Core {
    /// Construct a core from its configuration.
    ///
    /// If the seal supports stored keys, an auto-unseal is attempted;
    /// its failure does not prevent construction and is returned
    /// alongside the core as [`Error::NonFatal`] so the caller can
    /// report it and continue with manual unseal.
    pub async fn new(config: CoreConfig) -> Result<(Arc<Self>, Option<Error>)> {
        config.validate()?;

        let CoreConfig {
            physical,
            ha_backend,
            seal,
            auth,
            redirect_addr,
            cluster_addr,
            cluster_name,
            disable_cache,
            mut engine_factories,
            mut credential_factories,
            audit_factories,
            hooks,
            timings,
        } = config;

        let barrier = Arc::new(AesGcmBarrier::new(Arc::clone(&physical)));
        let seal = seal.unwrap_or_else(|| Arc::new(ShamirSeal::new(Arc::clone(&physical))));
        let auth = auth.unwrap_or_else(|| Arc::new(StaticRootBroker::new()));
        let ha = ha_backend.filter(|ha| ha.ha_enabled());

        // Built-in backend types always have a factory
        for builtin in ["kv", "system"] {
            engine_factories
                .entry(builtin.to_string())
                .or_insert_with(|| Arc::new(PassthroughFactory) as Arc<dyn EngineFactory>);
        }
        credential_factories
            .entry("token".to_string())
            .or_insert_with(|| Arc::new(PassthroughFactory) as Arc<dyn EngineFactory>);

        let core = Arc::new(Self {
            physical,
            ha,
            barrier,
            seal,
            auth,
            redirect_addr,
            cluster_addr,
            cluster_name,
            disable_cache,
            engine_factories,
            credential_factories,
            audit_factories,
            hooks,
            timings,
            metrics: CoreMetrics::new(),
            state: RwLock::new(CoreState::new()),
            leader_cache: RwLock::new(LeaderCache::default()),
            cluster_identity: RwLock::new(None),
            cluster_info: RwLock::new(None),
            forwarding: RwLock::new(None),
            rekey: RwLock::new(RekeyProgress::default()),
            metrics_lock: Mutex::new(()),
        });

        let non_fatal = match core.unseal_with_stored_keys().await {
            Ok(()) => None,
            Err(e) => {
                warn!("failed to unseal core with stored keys: {}", e);
                Some(Error::NonFatal(Box::new(e)))
            }
        };

        Ok((core, non_fatal))
    }

    /// The security barrier, for embedders wiring subsystems of their own
    pub fn barrier(&self) -> &Arc<AesGcmBarrier> {
        &self.barrier
    }

    /// The engine metrics registry
    pub fn metrics(&self) -> &CoreMetrics {
        &self.metrics
    }

    /// Whether both the barrier and the seal configuration exist
    pub async fn initialized(&self) -> Result<bool> {
        if !self.barrier.initialized().await? {
            return Ok(false);
        }
        Ok(self.seal.barrier_config().await?.is_some())
    }

    /// Whether the core is sealed
    pub async fn sealed(&self) -> bool {
        self.state.read().await.sealed
    }

    /// Whether the core is in standby mode
    pub async fn standby(&self) -> bool {
        self.state.read().await.standby
    }

    /// Persisted cluster name and id, populated after unseal
    pub async fn cluster_info(&self) -> Option<ClusterInfo> {
        self.cluster_info.read().await.clone()
    }

    /// Number of unseal shares collected so far and the session nonce
    pub async fn secret_progress(&self) -> (usize, String) {
        let state = self.state.read().await;
        match &state.unlock {
            Some(session) => (session.progress(), session.nonce().to_string()),
            None => (0, String::new()),
        }
    }

    /// Discard the current unseal attempt; only meaningful while sealed
    pub async fn reset_unseal(&self) {
        let mut state = self.state.write().await;
        if !state.sealed {
            return;
        }
        state.unlock = None;
        self.metrics.set_unseal_progress(0);
    }

    /// A receiver tied to the current activation; it fires when the
    /// activation is cancelled by seal or step-down. `None` on a node
    /// that is not active.
    pub async fn request_scope(&self) -> Option<watch::Receiver<bool>> {
        let state = self.state.read().await;
        state.active_scope.as_ref().map(watch::Sender::subscribe)
    }

    /// Attempt an unseal from seal-stored keys. `Ok` when the seal
    /// stores nothing; an actual unseal drives the same path as a
    /// threshold unseal.
    pub async fn unseal_with_stored_keys(self: &Arc<Self>) -> Result<()> {
        if !self.seal.stored_keys_supported() {
            return Ok(());
        }
        if !self.seal.unseal_with_stored_keys(&self.barrier).await? {
            return Ok(());
        }

        let mut state = self.state.write().await;
        if !state.sealed {
            return Ok(());
        }
        info!("unsealed with stored keys");
        self.finish_unseal(&mut state).await
    }

    /// Submit one unseal share. Returns `true` once the core is
    /// unsealed, `false` while more shares are needed.
    ///
    /// The caller's buffer is copied; the engine's copies are zeroized
    /// when the attempt completes or is reset.
    pub async fn unseal(self: &Arc<Self>, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidKey {
                reason: "no key provided".to_string(),
            });
        }
        let (min, max) = self.barrier.key_length();
        let max = max + shamir::SHARE_OVERHEAD;
        if key.len() < min {
            return Err(Error::InvalidKey {
                reason: format!("key is shorter than minimum {} bytes", min),
            });
        }
        if key.len() > max {
            return Err(Error::InvalidKey {
                reason: format!("key is longer than maximum {} bytes", max),
            });
        }

        let config = self.seal.barrier_config().await?.ok_or(Error::NotInit)?;

        let mut state = self.state.write().await;
        if !state.sealed {
            return Ok(true);
        }

        let session = state.unlock.get_or_insert_with(UnlockSession::new);
        let nonce = session.nonce().to_string();
        let threshold = config.secret_threshold as usize;

        match session.submit(key, threshold)? {
            SubmitOutcome::Progress { progress } => {
                debug!(
                    "cannot unseal, not enough keys: have {}, threshold {}, nonce {}",
                    progress, threshold, nonce
                );
                self.metrics.set_unseal_progress(progress);
                Ok(false)
            }
            SubmitOutcome::Complete { master_key } => {
                state.unlock = None;
                self.metrics.set_unseal_progress(0);
                self.unseal_internal(&mut state, master_key).await?;
                Ok(true)
            }
        }
    }

    /// Unseal the barrier with a reconstructed master key and drive the
    /// state machine forward. Must hold the state write lock.
    async fn unseal_internal(
        self: &Arc<Self>,
        state: &mut CoreState,
        master_key: Zeroizing<Vec<u8>>,
    ) -> Result<()> {
        self.barrier.unseal(&master_key).await?;
        info!("core unsealed");
        self.finish_unseal(state).await
    }

    /// Shared tail of the unseal paths: without HA run post-unseal and
    /// go active, with HA start the standby loop and wait for the lock
    async fn finish_unseal(self: &Arc<Self>, state: &mut CoreState) -> Result<()> {
        if self.ha.is_none() {
            // Cluster info is populated even outside a cluster so the
            // identity is stable if HA is enabled later
            if let Err(e) = self.setup_cluster_info().await {
                error!("cluster setup failed: {}", e);
                self.barrier.seal().await;
                warn!("core re-sealed");
                return Err(e);
            }
            if let Err(e) = self.post_unseal(state).await {
                self.barrier.seal().await;
                warn!("core re-sealed");
                return Err(e);
            }
            state.standby = false;
            self.metrics.set_standby(false);
        } else {
            let (stop_tx, stop_rx) = watch::channel(false);
            let (done_tx, done_rx) = oneshot::channel();
            let (step_tx, step_rx) = mpsc::channel(1);
            state.standby_stop = Some(stop_tx);
            state.standby_done = Some(done_rx);
            state.manual_step_down = Some(step_tx);

            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.run_standby(stop_rx, done_tx, step_rx).await;
            });
        }

        state.sealed = false;
        self.metrics.set_sealed(false);
        self.notify_sealed_state(false).await;
        Ok(())
    }

    /// Seal the core with a root token
    pub async fn seal(self: &Arc<Self>, token: &str) -> Result<()> {
        let req = Request::new(
            crate::contracts::Operation::Update,
            "sys/seal",
            token,
        );
        self.seal_with_request(req).await
    }

    /// Seal the core, authorizing and auditing the given request first
    pub async fn seal_with_request(self: &Arc<Self>, req: Request) -> Result<()> {
        {
            let state = self.state.read().await;
            if state.sealed {
                return Ok(());
            }
            // There is no live token store on a standby to authorize a
            // seal; the operator restarts the process instead
            if state.standby {
                error!("core cannot seal when in standby mode");
                return Err(Error::StandbySeal);
            }

            self.check_root_request(&state, &req).await?;

            // Tell in-flight requests to stop
            if let Some(scope) = &state.active_scope {
                let _ = scope.send(true);
            }
        }

        self.seal_internal().await
    }

    /// Step down from leadership without sealing. No-op when not the
    /// active HA node.
    pub async fn step_down(&self, req: Request) -> Result<()> {
        let state = self.state.read().await;
        if state.sealed {
            return Ok(());
        }
        if self.ha.is_none() || state.standby {
            return Ok(());
        }

        self.check_root_request(&state, &req).await?;

        if let Some(step_down) = &state.manual_step_down {
            if step_down.try_send(()).is_err() {
                warn!("manual step-down operation already queued");
            }
        }
        Ok(())
    }

    /// Graceful process-exit path: cancel in-flight work and seal
    /// without authorization, so HA failover happens quickly
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.cancel_active_scope().await;
        self.seal_internal().await
    }

    /// Internal seal path; performs no authorization checks
    pub(crate) async fn seal_internal(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sealed {
            return Ok(());
        }
        state.sealed = true;
        self.metrics.set_sealed(true);
        debug!("core marked as sealed");

        // Clear forwarding clients
        *self.forwarding.write().await = None;

        if self.ha.is_none() {
            state.standby = true;
            self.metrics.set_standby(true);
            let teardown = self.pre_seal(&mut state).await;
            self.barrier.seal().await;
            drop(state);

            self.notify_sealed_state(true).await;
            info!("core is sealed");
            teardown.map_err(|e| {
                error!("pre-seal teardown failed: {}", e);
                Error::Internal
            })
        } else {
            let stop = state.standby_stop.take();
            let done = state.standby_done.take();

            // Release the state lock while the standby loop winds down;
            // it needs the lock for its own teardown. This is the one
            // place the lock is released and re-acquired inside a
            // single logical operation.
            drop(state);
            if let Some(stop) = stop {
                let _ = stop.send(true);
            }
            if let Some(done) = done {
                let _ = done.await;
            }

            let state = self.state.write().await;
            self.barrier.seal().await;
            drop(state);

            self.notify_sealed_state(true).await;
            info!("core is sealed");
            Ok(())
        }
    }

    /// Report the current leader: `(is_leader, redirect_addr,
    /// cluster_addr)`. On standbys the advertisement is re-read only
    /// when the observed leader uuid changes.
    pub async fn leader(&self) -> Result<(bool, String, String)> {
        let state = self.state.read().await;
        if state.sealed {
            return Err(Error::Sealed);
        }
        let Some(ha) = &self.ha else {
            return Err(Error::HaNotEnabled);
        };

        if !state.standby {
            return Ok((true, self.redirect_addr.clone(), self.cluster_addr.clone()));
        }

        let lock = ha.lock_with(CORE_LOCK_PATH, "read")?;
        let (held, leader_uuid) = lock.value().await?;
        if !held {
            return Ok((false, String::new(), String::new()));
        }

        {
            let cache = self.leader_cache.read().await;
            if cache.uuid == leader_uuid && !cache.redirect_addr.is_empty() {
                return Ok((
                    false,
                    cache.redirect_addr.clone(),
                    cache.cluster_addr.clone(),
                ));
            }
        }

        trace!("found new active node information, refreshing");
        let mut cache = self.leader_cache.write().await;

        // Validate base conditions again under the write lock
        if cache.uuid == leader_uuid && !cache.redirect_addr.is_empty() {
            return Ok((
                false,
                cache.redirect_addr.clone(),
                cache.cluster_addr.clone(),
            ));
        }

        let key = format!("{}{}", LEADER_PREFIX, leader_uuid);
        let Some(entry) = self.barrier.get(&key).await? else {
            return Ok((false, String::new(), String::new()));
        };

        let adv = LeaderAdvertisement::decode(&entry.value)?;
        let forwarding = ForwardingParams::from_advertisement(&adv)?;
        *self.forwarding.write().await = Some(forwarding);

        // Not set until everything parsed successfully, or we would
        // never try again for this uuid
        cache.uuid = leader_uuid;
        cache.redirect_addr = adv.redirect_addr.clone();
        cache.cluster_addr = adv.cluster_addr.clone();

        Ok((false, adv.redirect_addr, adv.cluster_addr))
    }

    /// Load or create the persisted cluster name and id
    pub(crate) async fn setup_cluster_info(&self) -> Result<()> {
        let info = cluster::setup_cluster(&self.barrier, &self.cluster_name).await?;
        *self.cluster_info.write().await = Some(info);
        Ok(())
    }

    /// Verify root privileges for a request and audit the attempt.
    /// Auditing happens before the privilege decision, so a denied
    /// attempt is still recorded.
    pub(crate) async fn check_root_request(&self, state: &CoreState, req: &Request) -> Result<()> {
        let auth = self.auth.check(req).await?;
        if let Some(broker) = state.subsystems.audit_broker.clone() {
            broker.log_request(&auth, req).await?;
        }
        if !auth.root {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    /// Signal the current activation scope, if any
    pub(crate) async fn cancel_active_scope(&self) {
        let state = self.state.read().await;
        if let Some(scope) = &state.active_scope {
            let _ = scope.send(true);
        }
    }

    pub(crate) async fn notify_sealed_state(&self, sealed: bool) {
        if let Some(ha) = &self.ha {
            if let Some(sd) = ha.service_discovery() {
                if let Err(e) = sd.notify_sealed_state_change(sealed).await {
                    warn!("failed to notify sealed status: {}", e);
                }
            }
        }
    }

    pub(crate) async fn notify_active_state(&self, active: bool) {
        if let Some(ha) = &self.ha {
            if let Some(sd) = ha.service_discovery() {
                if let Err(e) = sd.notify_active_state_change(active).await {
                    warn!("failed to notify active status: {}", e);
                }
            }
        }
    }
}
