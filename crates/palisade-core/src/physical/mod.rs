//! Physical storage backend contracts
//!
//! The physical backend is the untrusted durable store underneath the
//! security barrier. Backends expose plain key/value operations plus a
//! set of optional capabilities (cache purging, transactions, HA locks,
//! service discovery) that callers probe for at runtime.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

mod inmem;

pub use inmem::{InmemBackend, InmemHaBackend};

/// A single key/value entry in the physical backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Storage key (slash-separated path)
    pub key: String,
    /// Raw value bytes (ciphertext when written through the barrier)
    pub value: Vec<u8>,
}

impl Entry {
    /// Create a new entry
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// One operation inside a backend transaction
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write an entry
    Put(Entry),
    /// Delete a key
    Delete(String),
}

/// Durable key/value storage.
///
/// `list` returns keys relative to the prefix; entries nested more than
/// one level deep are folded into a single `dir/` result, mirroring a
/// filesystem directory listing.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch an entry, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Write an entry, replacing any existing value
    async fn put(&self, entry: Entry) -> Result<()>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys under a prefix (see trait docs for folding semantics)
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Cache-purge capability, if this backend carries a cache layer
    fn purgeable(&self) -> Option<&dyn Purgeable> {
        None
    }

    /// Atomic multi-op capability, if this backend supports it
    fn transactional(&self) -> Option<&dyn Transactional> {
        None
    }
}

/// Capability: drop any cached entries (stale entries survive a seal)
#[async_trait]
pub trait Purgeable: Send + Sync {
    /// Drop every cached entry
    async fn purge(&self);
}

/// Capability: apply a batch of operations atomically
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Apply all operations, or none of them
    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<()>;
}

/// Capability: highly-available coordination via a backend lock
#[async_trait]
pub trait HaBackend: Send + Sync {
    /// Whether HA coordination is actually usable on this backend
    fn ha_enabled(&self) -> bool;

    /// Create a lock handle for `key`, advertising `value` as the holder
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>>;

    /// Service discovery hooks, if the backend integrates with one
    fn service_discovery(&self) -> Option<&dyn ServiceDiscovery> {
        None
    }
}

/// A single acquisition handle for a backend lock.
///
/// `lock` blocks until the lock is held or the stop channel fires. On
/// success it returns a watch channel that flips to `true` (or closes)
/// when leadership is lost out from underneath the holder.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Acquire the lock. Returns the leader-lost channel on success,
    /// `None` when interrupted by `stop`.
    async fn lock(&mut self, stop: watch::Receiver<bool>) -> Result<Option<watch::Receiver<bool>>>;

    /// Release the lock
    async fn unlock(&mut self) -> Result<()>;

    /// Read the current holder: `(held, holder_value)`
    async fn value(&self) -> Result<(bool, String)>;
}

/// Capability: notify an external catalog of state changes.
///
/// Both notifications are best-effort; callers log failures and carry on.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// The node sealed or unsealed
    async fn notify_sealed_state_change(&self, sealed: bool) -> Result<()>;

    /// The node became active or stood down
    async fn notify_active_state_change(&self, active: bool) -> Result<()>;
}
