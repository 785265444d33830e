//! Seal configuration
//!
//! The seal owns the persisted barrier configuration (share count,
//! threshold) and, for seal types backed by an external KMS, the
//! auto-stored unseal material. The configuration must be readable
//! while the barrier is sealed, so it lives in the physical backend as
//! plaintext JSON.

use std::sync::Arc;

use async_trait::async_trait;
use palisade_core::{AesGcmBarrier, Backend, Entry};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Path of the barrier seal configuration in the physical backend
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// Persisted seal configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    /// Seal implementation name, e.g. `shamir`
    #[serde(rename = "type")]
    pub seal_type: String,

    /// Number of shares the master key was split into
    pub secret_shares: u32,

    /// Shares required to reconstruct the master key
    pub secret_threshold: u32,

    /// Shares stored by the seal itself rather than handed out
    pub stored_shares: u32,

    /// PGP keys the shares were encrypted to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_keys: Option<Vec<String>>,

    /// Operation nonce of the initialization or rekey that produced
    /// this configuration
    pub nonce: String,

    /// Whether a plaintext backup of the shares was requested
    #[serde(default)]
    pub backup: bool,
}

impl SealConfig {
    /// Validate the share/threshold invariants
    pub fn validate(&self) -> Result<()> {
        if self.secret_shares < 1 {
            return Err(Error::Config(
                "share count must be at least one".to_string(),
            ));
        }
        if self.secret_shares > 255 {
            return Err(Error::Config("share count must be at most 255".to_string()));
        }
        if self.secret_threshold < 1 {
            return Err(Error::Config("threshold must be at least one".to_string()));
        }
        if self.secret_threshold > self.secret_shares {
            return Err(Error::Config(
                "threshold cannot exceed the share count".to_string(),
            ));
        }
        if self.secret_shares > 1 && self.secret_threshold == 1 {
            return Err(Error::Config(
                "threshold must be greater than one for multiple shares".to_string(),
            ));
        }
        Ok(())
    }
}

/// Seal contract consumed by the core.
///
/// `unseal_with_stored_keys` returns `Ok(false)` when the seal stores no
/// keys; that is the normal case for the Shamir seal, not an error.
#[async_trait]
pub trait Seal: Send + Sync {
    /// Seal implementation name
    fn seal_type(&self) -> &'static str;

    /// Whether this seal stores unseal material itself
    fn stored_keys_supported(&self) -> bool {
        false
    }

    /// Whether this seal carries an independent recovery threshold
    fn recovery_supported(&self) -> bool {
        false
    }

    /// The barrier configuration; `None` before initialization
    async fn barrier_config(&self) -> Result<Option<SealConfig>>;

    /// Persist a new barrier configuration
    async fn set_barrier_config(&self, config: SealConfig) -> Result<()>;

    /// The recovery configuration, for seals that support one
    async fn recovery_config(&self) -> Result<Option<SealConfig>> {
        Ok(None)
    }

    /// Drop any cached configuration so the next read is authoritative
    async fn clear_cached_configs(&self);

    /// Stash unseal material with the seal instead of handing it to
    /// operators. Only called when `stored_keys_supported()` reports
    /// true; seals without storage refuse.
    async fn set_stored_keys(&self, _keys: &[Vec<u8>]) -> Result<()> {
        Err(Error::Config(
            "this seal does not support stored keys".to_string(),
        ))
    }

    /// Unseal the barrier from stored keys; `Ok(true)` on success,
    /// `Ok(false)` when no stored keys exist
    async fn unseal_with_stored_keys(&self, barrier: &AesGcmBarrier) -> Result<bool>;
}

/// The default seal: operator-held Shamir shares, nothing auto-stored
pub struct ShamirSeal {
    physical: Arc<dyn Backend>,
    cached: RwLock<Option<SealConfig>>,
}

impl ShamirSeal {
    /// Create a seal over the physical backend
    pub fn new(physical: Arc<dyn Backend>) -> Self {
        Self {
            physical,
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Seal for ShamirSeal {
    fn seal_type(&self) -> &'static str {
        "shamir"
    }

    async fn barrier_config(&self) -> Result<Option<SealConfig>> {
        {
            let cached = self.cached.read().await;
            if cached.is_some() {
                return Ok(cached.clone());
            }
        }

        let Some(entry) = self.physical.get(SEAL_CONFIG_PATH).await? else {
            return Ok(None);
        };
        let config: SealConfig = serde_json::from_slice(&entry.value)
            .map_err(|e| Error::Config(format!("corrupt seal configuration: {}", e)))?;
        config.validate()?;

        let mut cached = self.cached.write().await;
        *cached = Some(config.clone());
        Ok(Some(config))
    }

    async fn set_barrier_config(&self, config: SealConfig) -> Result<()> {
        config.validate()?;
        let value = serde_json::to_vec(&config)?;
        self.physical
            .put(Entry::new(SEAL_CONFIG_PATH, value))
            .await?;

        let mut cached = self.cached.write().await;
        *cached = Some(config);
        Ok(())
    }

    async fn clear_cached_configs(&self) {
        let mut cached = self.cached.write().await;
        if cached.take().is_some() {
            debug!("cleared cached seal configuration");
        }
    }

    async fn unseal_with_stored_keys(&self, _barrier: &AesGcmBarrier) -> Result<bool> {
        // The Shamir seal never stores unseal material
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::physical::InmemBackend;

    fn config(shares: u32, threshold: u32) -> SealConfig {
        SealConfig {
            seal_type: "shamir".to_string(),
            secret_shares: shares,
            secret_threshold: threshold,
            stored_shares: 0,
            pgp_keys: None,
            nonce: "test-nonce".to_string(),
            backup: false,
        }
    }

    #[test]
    fn test_validate_share_threshold_invariants() {
        assert!(config(3, 2).validate().is_ok());
        assert!(config(1, 1).validate().is_ok());
        assert!(config(0, 1).validate().is_err());
        assert!(config(3, 4).validate().is_err());
        assert!(config(3, 0).validate().is_err());
        assert!(config(3, 1).validate().is_err());
        assert!(config(300, 2).validate().is_err());
    }

    #[tokio::test]
    async fn test_shamir_seal_stores_nothing() {
        let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
        let seal = ShamirSeal::new(Arc::clone(&backend));
        assert!(!seal.stored_keys_supported());

        let barrier = AesGcmBarrier::new(backend);
        assert!(!seal.unseal_with_stored_keys(&barrier).await.unwrap());
        assert!(seal.set_stored_keys(&[vec![0u8; 33]]).await.is_err());
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_cache_clear() {
        let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
        let seal = ShamirSeal::new(Arc::clone(&backend));

        assert!(seal.barrier_config().await.unwrap().is_none());

        seal.set_barrier_config(config(5, 3)).await.unwrap();
        let loaded = seal.barrier_config().await.unwrap().unwrap();
        assert_eq!(loaded.secret_shares, 5);
        assert_eq!(loaded.secret_threshold, 3);

        // The config must be readable by a fresh seal (sealed node)
        let fresh = ShamirSeal::new(backend);
        assert!(fresh.barrier_config().await.unwrap().is_some());

        seal.clear_cached_configs().await;
        assert!(seal.barrier_config().await.unwrap().is_some());
    }
}
