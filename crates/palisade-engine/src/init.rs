//! One-shot initialization
//!
//! Generates the barrier master key, splits it into operator shares,
//! initializes the barrier, persists the seal configuration, and
//! bootstraps the root principal. The barrier is unsealed only for the
//! duration of the bootstrap and re-sealed before the shares are
//! handed back.

use tracing::{error, info};
use uuid::Uuid;

use palisade_core::{shamir, AesGcmBarrier};

use crate::core::Core;
use crate::error::{Error, Result};
use crate::seal::SealConfig;

/// Parameters for initializing a fresh core
#[derive(Debug, Clone)]
pub struct InitParams {
    /// Number of shares to split the master key into
    pub secret_shares: u32,
    /// Shares required to unseal
    pub secret_threshold: u32,
    /// PGP keys to encrypt the shares to, recorded in the seal config
    pub pgp_keys: Option<Vec<String>>,
}

/// The one-time output of initialization
pub struct InitResult {
    /// The master key shares; empty when the seal stores them itself
    pub secret_shares: Vec<Vec<u8>>,
    /// The bootstrap root token
    pub root_token: String,
}

impl std::fmt::Debug for InitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitResult")
            .field("secret_shares", &self.secret_shares.len())
            .field("root_token", &"[REDACTED]")
            .finish()
    }
}

impl Core {
    /// Initialize a fresh core. Fails with [`Error::AlreadyInit`] if a
    /// barrier keyring or seal configuration already exists.
    pub async fn initialize(&self, params: InitParams) -> Result<InitResult> {
        let config = SealConfig {
            seal_type: self.seal.seal_type().to_string(),
            secret_shares: params.secret_shares,
            secret_threshold: params.secret_threshold,
            stored_shares: if self.seal.stored_keys_supported() {
                params.secret_shares
            } else {
                0
            },
            pgp_keys: params.pgp_keys,
            nonce: Uuid::new_v4().to_string(),
            backup: false,
        };
        config.validate()?;

        // Hold the state lock so initialization cannot race an unseal
        let _state = self.state.write().await;

        if self.barrier.initialized().await? || self.seal.barrier_config().await?.is_some() {
            return Err(Error::AlreadyInit);
        }

        let master_key = AesGcmBarrier::generate_key();
        let shares = if config.secret_shares == 1 {
            vec![master_key.to_vec()]
        } else {
            shamir::split(
                &master_key,
                config.secret_shares as u8,
                config.secret_threshold as u8,
            )?
        };

        self.barrier.initialize(&master_key).await?;
        self.barrier.unseal(&master_key).await?;

        // The bootstrap runs against a momentarily unsealed barrier;
        // whatever happens, re-seal before returning
        let bootstrap: Result<String> = async {
            self.seal.set_barrier_config(config.clone()).await?;
            if self.seal.stored_keys_supported() {
                self.seal.set_stored_keys(&shares).await?;
            }
            self.auth.bootstrap_root().await
        }
        .await;
        self.barrier.seal().await;

        let root_token = bootstrap.map_err(|e| {
            error!("initialization bootstrap failed: {}", e);
            e
        })?;

        info!(
            "core initialized with {} shares, threshold {}",
            config.secret_shares, config.secret_threshold
        );

        let secret_shares = if self.seal.stored_keys_supported() {
            Vec::new()
        } else {
            shares
        };
        Ok(InitResult {
            secret_shares,
            root_token,
        })
    }
}
