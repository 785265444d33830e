//! Lifecycle orchestration
//!
//! Post-unseal brings dependent subsystems up in strict order, storage
//! first and network last; pre-seal tears them down in reverse so no
//! subsystem outlives something it depends on (expiration must never
//! try to revoke through a barrier that has already been resealed).
//! Any post-unseal failure aborts the remainder and immediately runs
//! pre-seal; pre-seal failures are accumulated so every step is
//! attempted.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::audit::{self, AuditBroker, AuditedHeadersConfig, AUDIT_TABLE_PATH, AUDIT_VIEW_PREFIX};
use crate::catalog::{self, PluginCatalog};
use crate::contracts::{EngineBackend, StorageView};
use crate::core::{Core, CoreState};
use crate::cors::{self, CorsConfig};
use crate::error::{Error, Result};
use crate::expiration::{ExpirationManager, LEASE_PREFIX};
use crate::listener::ClusterListener;
use crate::mounts::{
    self, MountTable, AUTH_TABLE_PATH, CREDENTIAL_VIEW_PREFIX, ENGINE_VIEW_PREFIX,
    MOUNT_TABLE_PATH,
};
use crate::policy::{PolicyStore, POLICY_PREFIX};
use crate::rollback::RollbackManager;
use crate::wrapping::{self, WrappingKey};

/// A background task with explicit stop/done channels. The task closes
/// its done channel on exit, and `stop` joins it before returning.
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    done: oneshot::Receiver<()>,
}

impl WorkerHandle {
    /// Spawn `task` with a stop channel it must honor
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let fut = task(stop_rx);
        tokio::spawn(async move {
            fut.await;
            let _ = done_tx.send(());
        });
        Self {
            stop: stop_tx,
            done: done_rx,
        }
    }

    /// Signal the task to stop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.done.await;
    }
}

/// Everything post-unseal brings up and pre-seal tears down.
///
/// All of this state is garbage once the core is sealed; dropping the
/// struct fields is the teardown for the passive entries, the active
/// ones (workers, managers) are stopped explicitly.
#[derive(Default)]
pub(crate) struct Subsystems {
    pub wrapping_key: Option<WrappingKey>,
    pub plugin_catalog: Option<PluginCatalog>,
    pub mounts: Option<MountTable>,
    pub engines: Vec<(String, Arc<dyn EngineBackend>)>,
    pub policy_store: Option<Arc<PolicyStore>>,
    pub cors_config: Option<CorsConfig>,
    pub credentials: Option<MountTable>,
    pub credential_backends: Vec<(String, Arc<dyn EngineBackend>)>,
    pub rollback: Option<RollbackManager>,
    pub expiration: Option<Arc<ExpirationManager>>,
    pub audit_table: Option<MountTable>,
    pub audit_broker: Option<Arc<AuditBroker>>,
    pub audited_headers: Option<AuditedHeadersConfig>,
    pub cluster_listener: Option<ClusterListener>,
    pub metrics_worker: Option<WorkerHandle>,
}

impl Core {
    /// Bring the core to full operation after the barrier is unsealed.
    /// On success the activation scope is installed; on failure the
    /// teardown has already run and the error is returned.
    pub(crate) async fn post_unseal(self: &Arc<Self>, state: &mut CoreState) -> Result<()> {
        match self.post_unseal_inner(state).await {
            Ok(()) => {
                let (scope_tx, _scope_rx) = watch::channel(false);
                state.active_scope = Some(scope_tx);
                info!("post-unseal setup complete");
                Ok(())
            }
            Err(e) => {
                error!("post-unseal setup failed: {}", e);
                if let Err(teardown) = self.pre_seal(state).await {
                    warn!(
                        "pre-seal teardown after failed post-unseal also failed: {}",
                        teardown
                    );
                }
                Err(e)
            }
        }
    }

    async fn post_unseal_inner(self: &Arc<Self>, state: &mut CoreState) -> Result<()> {
        info!("post-unseal setup starting");

        // We are becoming active, not a standby
        *self.forwarding.write().await = None;

        // Stale cache entries survive a seal
        if !self.disable_cache {
            if let Some(purgeable) = self.physical.purgeable() {
                purgeable.purge().await;
            }
        }

        // The next config read must be authoritative, in case a rekey
        // happened while we were sealed or standby
        self.seal.clear_cached_configs().await;

        for hook in &self.hooks {
            hook.post_unseal().await?;
        }

        state.subsystems.wrapping_key = Some(wrapping::ensure_wrapping_key(&self.barrier).await?);
        state.subsystems.plugin_catalog = Some(catalog::load_catalog(&self.barrier).await?);

        // Mount table and the engines behind it
        let mount_table = match mounts::load_table(&self.barrier, MOUNT_TABLE_PATH).await? {
            Some(table) => table,
            None => {
                let table = MountTable::default_mounts();
                mounts::persist_table(&self.barrier, MOUNT_TABLE_PATH, &table).await?;
                table
            }
        };
        for entry in &mount_table.entries {
            let factory = self.engine_factories.get(&entry.entry_type).ok_or_else(|| {
                Error::Config(format!("no engine factory for mount type {:?}", entry.entry_type))
            })?;
            let view = StorageView::new(
                Arc::clone(&self.barrier),
                format!("{}{}/", ENGINE_VIEW_PREFIX, entry.uuid),
            );
            let engine = factory.create(entry, view).await?;
            state.subsystems.engines.push((entry.path.clone(), engine));
        }
        state.subsystems.mounts = Some(mount_table);

        let policy_store = Arc::new(PolicyStore::new(StorageView::new(
            Arc::clone(&self.barrier),
            POLICY_PREFIX,
        )));
        policy_store.setup().await?;
        state.subsystems.policy_store = Some(policy_store);

        state.subsystems.cors_config = Some(cors::load_cors_config(&self.barrier).await?);

        // Credential table and the auth backends behind it
        let auth_table = match mounts::load_table(&self.barrier, AUTH_TABLE_PATH).await? {
            Some(table) => table,
            None => {
                let table = MountTable::default_credentials();
                mounts::persist_table(&self.barrier, AUTH_TABLE_PATH, &table).await?;
                table
            }
        };
        for entry in &auth_table.entries {
            let factory = self
                .credential_factories
                .get(&entry.entry_type)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no credential factory for auth type {:?}",
                        entry.entry_type
                    ))
                })?;
            let view = StorageView::new(
                Arc::clone(&self.barrier),
                format!("{}{}/", CREDENTIAL_VIEW_PREFIX, entry.uuid),
            );
            let backend = factory.create(entry, view).await?;
            state.subsystems.credential_backends.push((entry.path.clone(), backend));
        }
        state.subsystems.credentials = Some(auth_table);

        state.subsystems.rollback = Some(RollbackManager::start(
            state.subsystems.engines.clone(),
            self.timings.rollback_period,
        ));

        state.subsystems.expiration = Some(
            ExpirationManager::start(
                StorageView::new(Arc::clone(&self.barrier), LEASE_PREFIX),
                self.timings.expiration_sweep_interval,
            )
            .await?,
        );

        // Audit devices, then the headers they record
        let audit_table = match mounts::load_table(&self.barrier, AUDIT_TABLE_PATH).await? {
            Some(table) => table,
            None => {
                let table = MountTable::default();
                mounts::persist_table(&self.barrier, AUDIT_TABLE_PATH, &table).await?;
                table
            }
        };
        let mut broker = AuditBroker::new();
        for entry in &audit_table.entries {
            let factory = self.audit_factories.get(&entry.entry_type).ok_or_else(|| {
                Error::Config(format!("no audit factory for type {:?}", entry.entry_type))
            })?;
            let view = StorageView::new(
                Arc::clone(&self.barrier),
                format!("{}{}/", AUDIT_VIEW_PREFIX, entry.uuid),
            );
            broker.register(entry.path.clone(), factory.create(entry, view).await?);
        }
        state.subsystems.audit_broker = Some(Arc::new(broker));
        state.subsystems.audit_table = Some(audit_table);
        state.subsystems.audited_headers = Some(audit::load_audited_headers(&self.barrier).await?);

        // Network comes up last
        if self.ha.is_some() {
            state.subsystems.cluster_listener = Some(ClusterListener::start(&self.cluster_addr));
        }
        state.subsystems.metrics_worker =
            Some(self.start_metrics_worker(state.subsystems.expiration.clone()));

        Ok(())
    }

    /// Tear down everything post-unseal brought up, in reverse order.
    /// Independent failures are accumulated, not short-circuited.
    pub(crate) async fn pre_seal(self: &Arc<Self>, state: &mut CoreState) -> Result<()> {
        info!("pre-seal teardown starting");
        let mut errors: Vec<Error> = Vec::new();

        // Clear any rekey progress
        {
            let mut rekey = self.rekey.write().await;
            rekey.barrier = None;
            rekey.recovery = None;
        }

        if let Some(worker) = state.subsystems.metrics_worker.take() {
            worker.stop().await;
        }
        if let Some(listener) = state.subsystems.cluster_listener.take() {
            listener.stop().await;
        }

        state.subsystems.audited_headers = None;
        state.subsystems.audit_broker = None;
        state.subsystems.audit_table = None;

        if let Some(expiration) = state.subsystems.expiration.take() {
            // Sequence against a metrics emission already in flight
            let _metrics_guard = self.metrics_lock.lock().await;
            expiration.stop().await;
        }

        for (_path, backend) in state.subsystems.credential_backends.drain(..) {
            backend.teardown().await;
        }
        state.subsystems.credentials = None;

        state.subsystems.policy_store = None;

        if let Some(rollback) = state.subsystems.rollback.take() {
            rollback.stop().await;
        }

        for (_path, backend) in state.subsystems.engines.drain(..) {
            backend.teardown().await;
        }
        state.subsystems.mounts = None;
        state.subsystems.cors_config = None;
        state.subsystems.plugin_catalog = None;
        state.subsystems.wrapping_key = None;

        for hook in self.hooks.iter().rev() {
            if let Err(e) = hook.pre_seal().await {
                error!("lifecycle hook {} failed during pre-seal: {}", hook.name(), e);
                errors.push(e);
            }
        }

        if !self.disable_cache {
            if let Some(purgeable) = self.physical.purgeable() {
                purgeable.purge().await;
            }
        }

        state.active_scope = None;

        info!("pre-seal teardown complete");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multi(errors))
        }
    }
}
