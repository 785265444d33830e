//! Key rotation and barrier rekey
//!
//! Rotation advances the keyring term under the same master key and
//! leaves an upgrade-chain entry for standbys to walk. A rekey replaces
//! the master key itself: the operator proves knowledge of the current
//! key by submitting a threshold of existing shares, and receives a
//! fresh split under the new configuration. Both operations write the
//! keyring canary so replicated clusters true up synchronously.

use std::sync::Arc;

use tracing::{debug, info};

use palisade_core::{shamir, AesGcmBarrier, Entry};

use crate::contracts::Request;
use crate::core::{Core, RekeyState};
use crate::error::{Error, Result};
use crate::ha::KEYRING_CANARY_PATH;
use crate::init::InitParams;
use crate::seal::SealConfig;
use crate::unlock::SubmitOutcome;

/// The one-time output of a completed barrier rekey
pub struct RekeyResult {
    /// Shares of the new master key; empty when the seal stores them
    pub secret_shares: Vec<Vec<u8>>,
}

impl std::fmt::Debug for RekeyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RekeyResult")
            .field("secret_shares", &self.secret_shares.len())
            .finish()
    }
}

impl Core {
    /// Rotate the barrier keyring to a new term. Requires root
    /// privileges on the active node; the upgrade-chain entry left for
    /// standbys is retired by the grace-period sweep.
    pub async fn rotate(self: &Arc<Self>, req: Request) -> Result<u32> {
        {
            let state = self.state.read().await;
            if state.sealed {
                return Err(Error::Sealed);
            }
            if state.standby {
                return Err(Error::Standby);
            }
            self.check_root_request(&state, &req).await?;
        }

        let term = self.barrier.rotate().await?;
        self.schedule_upgrade_cleanup().await?;

        self.barrier
            .put(Entry::new(
                KEYRING_CANARY_PATH,
                term.to_string().into_bytes(),
            ))
            .await?;
        Ok(term)
    }

    /// Begin a barrier rekey toward a new share configuration.
    /// Returns the operation nonce.
    pub async fn rekey_init(&self, params: InitParams) -> Result<String> {
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
            nonce: String::new(),
            backup: false,
        };
        config.validate()?;

        let state = self.state.read().await;
        if state.sealed {
            return Err(Error::Sealed);
        }
        if state.standby {
            return Err(Error::Standby);
        }

        let mut rekey = self.rekey.write().await;
        if rekey.barrier.is_some() {
            return Err(Error::Config(
                "barrier rekey already in progress".to_string(),
            ));
        }
        let pending = RekeyState::new(config);
        let nonce = pending.config.nonce.clone();
        info!(
            "barrier rekey initialized: {} shares, threshold {}",
            pending.config.secret_shares, pending.config.secret_threshold
        );
        rekey.barrier = Some(pending);
        Ok(nonce)
    }

    /// Shares collected toward the pending rekey and its nonce, `None`
    /// when no rekey is in progress
    pub async fn rekey_progress(&self) -> Option<(usize, String)> {
        let rekey = self.rekey.read().await;
        rekey
            .barrier
            .as_ref()
            .map(|pending| (pending.session.progress(), pending.config.nonce.clone()))
    }

    /// Abandon the pending rekey attempt
    pub async fn rekey_cancel(&self) {
        let mut rekey = self.rekey.write().await;
        if rekey.barrier.take().is_some() {
            info!("barrier rekey canceled");
        }
    }

    /// Submit one share of the current master key toward the pending
    /// rekey. Returns `None` while more shares are needed; once the
    /// current threshold is met and verified, the master key is
    /// replaced and the new shares are returned.
    ///
    /// The attempt is consumed by reconstruction whether or not it
    /// verifies; on failure the operator starts the rekey over.
    pub async fn rekey_update(&self, key: &[u8]) -> Result<Option<RekeyResult>> {
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

        let current = self.seal.barrier_config().await?.ok_or(Error::NotInit)?;

        let state = self.state.read().await;
        if state.sealed {
            return Err(Error::Sealed);
        }
        if state.standby {
            return Err(Error::Standby);
        }

        let mut rekey = self.rekey.write().await;
        let outcome = {
            let Some(pending) = rekey.barrier.as_mut() else {
                return Err(Error::Config("no barrier rekey in progress".to_string()));
            };
            pending.session.submit(key, current.secret_threshold as usize)?
        };

        match outcome {
            SubmitOutcome::Progress { progress } => {
                debug!(
                    "rekey progress: have {}, threshold {}",
                    progress, current.secret_threshold
                );
                Ok(None)
            }
            SubmitOutcome::Complete { master_key } => {
                let Some(pending) = rekey.barrier.take() else {
                    return Err(Error::Internal);
                };

                self.barrier
                    .verify_master(&master_key)
                    .await
                    .map_err(|_| Error::InvalidKey {
                        reason: "provided keys do not match the current master key".to_string(),
                    })?;

                let new_master = AesGcmBarrier::generate_key();
                let shares = if pending.config.secret_shares == 1 {
                    vec![new_master.to_vec()]
                } else {
                    shamir::split(
                        &new_master,
                        pending.config.secret_shares as u8,
                        pending.config.secret_threshold as u8,
                    )?
                };

                self.barrier.rekey(&new_master).await?;
                self.seal.set_barrier_config(pending.config.clone()).await?;
                if self.seal.stored_keys_supported() {
                    self.seal.set_stored_keys(&shares).await?;
                }

                self.barrier
                    .put(Entry::new(
                        KEYRING_CANARY_PATH,
                        pending.config.nonce.clone().into_bytes(),
                    ))
                    .await?;

                info!(
                    "barrier rekeyed: {} shares, threshold {}",
                    pending.config.secret_shares, pending.config.secret_threshold
                );

                let secret_shares = if self.seal.stored_keys_supported() {
                    Vec::new()
                } else {
                    shares
                };
                Ok(Some(RekeyResult { secret_shares }))
            }
        }
    }
}
