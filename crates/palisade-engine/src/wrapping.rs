//! Response-wrapping key
//!
//! The JWT signing key for response wrapping must exist before any
//! request handling starts, so ensuring it is one of the first
//! post-unseal steps. The key is ECDSA P-521, persisted through the
//! barrier as a PKCS#8 DER document.

use p521::ecdsa::SigningKey;
use p521::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p521::SecretKey;
use rand::rngs::OsRng;
use tracing::{debug, error, info};

use palisade_core::{AesGcmBarrier, Entry};

use crate::error::{Error, Result};

/// Path of the persisted wrapping key
pub const WRAPPING_KEY_PATH: &str = "core/wrapping/jwtkey";

/// The response-wrapping JWT signing key
pub struct WrappingKey {
    secret: SecretKey,
}

impl WrappingKey {
    /// A signing key view of the wrapping key
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret.to_bytes()).expect("secret key is always valid")
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappingKey([REDACTED])")
    }
}

/// Load the wrapping key, creating and persisting it if absent
pub async fn ensure_wrapping_key(barrier: &AesGcmBarrier) -> Result<WrappingKey> {
    if let Some(entry) = barrier.get(WRAPPING_KEY_PATH).await? {
        let secret = SecretKey::from_pkcs8_der(&entry.value).map_err(|e| {
            error!("corrupt wrapping key: {}", e);
            Error::Internal
        })?;
        debug!("loaded existing response-wrapping key");
        return Ok(WrappingKey { secret });
    }

    let secret = SecretKey::random(&mut OsRng);
    let der = secret.to_pkcs8_der().map_err(|e| {
        error!("failed to encode wrapping key: {}", e);
        Error::Internal
    })?;
    barrier
        .put(Entry::new(WRAPPING_KEY_PATH, der.as_bytes().to_vec()))
        .await?;
    info!("created response-wrapping key");
    Ok(WrappingKey { secret })
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::physical::InmemBackend;
    use palisade_core::Backend;
    use std::sync::Arc;

    async fn unsealed_barrier() -> AesGcmBarrier {
        let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
        let barrier = AesGcmBarrier::new(backend);
        let master = AesGcmBarrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier
    }

    #[tokio::test]
    async fn test_key_is_created_once_and_reloaded() {
        let barrier = unsealed_barrier().await;

        let first = ensure_wrapping_key(&barrier).await.unwrap();
        let second = ensure_wrapping_key(&barrier).await.unwrap();

        assert_eq!(first.secret.to_bytes(), second.secret.to_bytes());
    }

    #[tokio::test]
    async fn test_persisted_key_is_pkcs8_der() {
        let barrier = unsealed_barrier().await;
        let key = ensure_wrapping_key(&barrier).await.unwrap();

        let entry = barrier.get(WRAPPING_KEY_PATH).await.unwrap().unwrap();
        let decoded = SecretKey::from_pkcs8_der(&entry.value).unwrap();
        assert_eq!(decoded.to_bytes(), key.secret.to_bytes());
    }
}
