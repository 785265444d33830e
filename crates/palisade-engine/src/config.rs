//! Engine configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use palisade_core::{Backend, HaBackend};

use crate::contracts::{AuditFactory, AuthBroker, EngineFactory, LifecycleHook};
use crate::error::{Error, Result};
use crate::seal::Seal;

/// Intervals and grace periods used by the HA loop and periodic workers.
///
/// Defaults match production behavior; suites compress them to keep
/// multi-node scenarios fast.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Retry interval after a failed HA lock acquisition
    pub lock_retry_interval: Duration,

    /// How often a standby re-evaluates the cached leader
    pub leader_check_interval: Duration,

    /// How often a standby checks the poison pill and key upgrades
    pub key_rotate_check_interval: Duration,

    /// How long upgrade-chain entries outlive a leader takeover
    pub key_rotate_grace_period: Duration,

    /// Pause between deletions of stale sibling leader entries
    pub leader_prefix_clean_delay: Duration,

    /// Sleep after a manual step-down so another node can take the lock
    pub manual_step_down_sleep_period: Duration,

    /// Interval between rollback passes over the mounted engines
    pub rollback_period: Duration,

    /// Interval between expiration sweeps
    pub expiration_sweep_interval: Duration,

    /// Interval between metrics emissions on the active node
    pub metrics_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            lock_retry_interval: Duration::from_secs(10),
            leader_check_interval: Duration::from_millis(2500),
            key_rotate_check_interval: Duration::from_secs(30),
            key_rotate_grace_period: Duration::from_secs(120),
            leader_prefix_clean_delay: Duration::from_millis(200),
            manual_step_down_sleep_period: Duration::from_secs(10),
            rollback_period: Duration::from_secs(60),
            expiration_sweep_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(1),
        }
    }
}

/// Parameters for constructing a [`Core`](crate::core::Core)
pub struct CoreConfig {
    /// The untrusted durable backend
    pub physical: Arc<dyn Backend>,

    /// HA coordination backend; `None` disables HA operation
    pub ha_backend: Option<Arc<dyn HaBackend>>,

    /// Seal implementation; defaults to the Shamir seal
    pub seal: Option<Arc<dyn Seal>>,

    /// Token verification contract; defaults to a single-root broker
    pub auth: Option<Arc<dyn AuthBroker>>,

    /// Address advertised for client redirects while leader
    pub redirect_addr: String,

    /// Address used for cluster-internal request forwarding
    pub cluster_addr: String,

    /// Human-readable cluster name; generated when empty
    pub cluster_name: String,

    /// Skip backend cache purges during lifecycle transitions
    pub disable_cache: bool,

    /// Secret engine factories by type; `kv` gets a passthrough default
    pub engine_factories: HashMap<String, Arc<dyn EngineFactory>>,

    /// Credential backend factories by type
    pub credential_factories: HashMap<String, Arc<dyn EngineFactory>>,

    /// Audit backend factories by type
    pub audit_factories: HashMap<String, Arc<dyn AuditFactory>>,

    /// Lifecycle hooks run during post-unseal and pre-seal
    pub hooks: Vec<Arc<dyn LifecycleHook>>,

    /// Worker intervals and grace periods
    pub timings: Timings,
}

impl CoreConfig {
    /// A minimal configuration over the given backend
    pub fn new(physical: Arc<dyn Backend>) -> Self {
        Self {
            physical,
            ha_backend: None,
            seal: None,
            auth: None,
            redirect_addr: String::new(),
            cluster_addr: String::new(),
            cluster_name: String::new(),
            disable_cache: false,
            engine_factories: HashMap::new(),
            credential_factories: HashMap::new(),
            audit_factories: HashMap::new(),
            hooks: Vec::new(),
            timings: Timings::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let ha_enabled = self
            .ha_backend
            .as_ref()
            .map(|ha| ha.ha_enabled())
            .unwrap_or(false);

        if ha_enabled {
            if self.redirect_addr.is_empty() {
                return Err(Error::Config("missing redirect address".to_string()));
            }
            // The redirect address is handed to clients verbatim, so it
            // must at least carry a scheme
            if !self.redirect_addr.contains("://") {
                return Err(Error::Config(
                    "redirect address must include scheme (ex. 'https')".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::physical::InmemHaBackend;

    #[test]
    fn test_ha_requires_redirect_addr() {
        let ha = Arc::new(InmemHaBackend::new());
        let mut config = CoreConfig::new(ha.storage() as Arc<dyn Backend>);
        config.ha_backend = Some(ha as Arc<dyn HaBackend>);

        assert!(config.validate().is_err());

        config.redirect_addr = "node-a:8200".to_string();
        assert!(config.validate().is_err());

        config.redirect_addr = "https://node-a:8200".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_ha_needs_no_addresses() {
        let ha = InmemHaBackend::new();
        let config = CoreConfig::new(ha.storage() as Arc<dyn Backend>);
        assert!(config.validate().is_ok());
    }
}
