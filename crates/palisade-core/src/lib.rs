//! Palisade Core - Storage contracts, security barrier, and secret sharing
//!
//! This crate provides the foundational layer of the Palisade secrets
//! engine: the untrusted physical backend contracts (with an in-memory
//! reference implementation), the AES-GCM security barrier that wraps a
//! backend in authenticated encryption, and the Shamir split/combine
//! wrapper used to protect the barrier master key.

pub mod barrier;
pub mod error;
pub mod physical;
pub mod shamir;

pub use barrier::{AesGcmBarrier, BarrierKey, Keyring, KEYRING_PATH, MASTER_KEY_PATH, UPGRADE_PREFIX};
pub use error::{Error, Result};
pub use physical::{Backend, Entry, HaBackend, Lock, Purgeable, ServiceDiscovery, Transactional};
pub use shamir::SHARE_OVERHEAD;

/// Length of a barrier encryption key in bytes (AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length for AES-GCM in bytes
pub const NONCE_LENGTH: usize = 12;
