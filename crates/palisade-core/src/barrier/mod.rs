//! Security barrier
//!
//! The barrier wraps the untrusted physical backend in authenticated
//! encryption. Every entry written through it is encrypted under the
//! active keyring term with the entry path bound as associated data, so
//! ciphertext cannot be replayed at a different path.

mod aesgcm;
mod keyring;

pub use aesgcm::{AesGcmBarrier, KEYRING_PATH, MASTER_KEY_PATH, UPGRADE_PREFIX};
pub use keyring::{BarrierKey, Keyring};
