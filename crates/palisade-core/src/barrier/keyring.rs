//! Barrier keyring
//!
//! The keyring tracks every encryption key the barrier has ever used,
//! indexed by term, plus the master key that protects the keyring
//! itself. Terms only ever grow; older terms are kept so entries
//! written under them remain readable until rewritten.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// A single barrier encryption key
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct BarrierKey {
    /// Keyring term this key belongs to
    pub term: u32,

    /// Raw AES-256 key material
    #[serde(with = "base64_vec")]
    pub value: Vec<u8>,

    /// Unix timestamp of installation
    pub installed_at: u64,
}

impl BarrierKey {
    /// Create a key for `term` with the given material
    pub fn new(term: u32, value: Vec<u8>) -> Self {
        let installed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            term,
            value,
            installed_at,
        }
    }
}

impl std::fmt::Debug for BarrierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierKey")
            .field("term", &self.term)
            .field("value", &"[REDACTED]")
            .field("installed_at", &self.installed_at)
            .finish()
    }
}

/// The full set of barrier keys plus the master key protecting them
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Keyring {
    #[serde(with = "base64_vec")]
    master_key: Vec<u8>,

    /// Keys in ascending term order
    keys: Vec<BarrierKey>,

    active_term: u32,
}

impl Keyring {
    /// Create a keyring with its first key installed and active
    pub fn new(master_key: Vec<u8>, initial_key: BarrierKey) -> Self {
        let active_term = initial_key.term;
        Self {
            master_key,
            keys: vec![initial_key],
            active_term,
        }
    }

    /// The currently active term
    pub fn active_term(&self) -> u32 {
        self.active_term
    }

    /// The key for the active term
    pub fn active_key(&self) -> Option<&BarrierKey> {
        self.term_key(self.active_term)
    }

    /// The key for a specific term, if installed
    pub fn term_key(&self, term: u32) -> Option<&BarrierKey> {
        self.keys.iter().find(|k| k.term == term)
    }

    /// The master key protecting this keyring
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Replace the master key (picked up from a rekey by another node)
    pub fn set_master_key(&mut self, mut master_key: Vec<u8>) {
        std::mem::swap(&mut self.master_key, &mut master_key);
        master_key.zeroize();
    }

    /// Install a key. Re-installing an identical key is a no-op; a
    /// conflicting key for an existing term is an error.
    pub fn add_key(&mut self, key: BarrierKey) -> Result<()> {
        if let Some(existing) = self.term_key(key.term) {
            if existing.value == key.value {
                return Ok(());
            }
            return Err(Error::KeyTerm(format!(
                "conflicting key material for term {}",
                key.term
            )));
        }
        self.keys.push(key);
        self.keys.sort_by_key(|k| k.term);
        Ok(())
    }

    /// Advance the active term. The chain only moves forward and the
    /// target key must already be installed.
    pub fn set_active_term(&mut self, term: u32) -> Result<()> {
        if term < self.active_term {
            return Err(Error::KeyTerm(format!(
                "cannot move active term backwards ({} -> {})",
                self.active_term, term
            )));
        }
        if self.term_key(term).is_none() {
            return Err(Error::KeyTerm(format!("no key installed for term {}", term)));
        }
        self.active_term = term;
        Ok(())
    }

    /// Encode for persistence (callers encrypt the result)
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a persisted keyring
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let keyring: Keyring = serde_json::from_slice(bytes)?;
        if keyring.keys.is_empty() {
            return Err(Error::Serialization("keyring has no keys".to_string()));
        }
        if keyring.term_key(keyring.active_term).is_none() {
            return Err(Error::Serialization(
                "keyring active term has no key".to_string(),
            ));
        }
        Ok(keyring)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("active_term", &self.active_term)
            .field("keys", &self.keys.len())
            .finish()
    }
}

mod base64_vec {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
