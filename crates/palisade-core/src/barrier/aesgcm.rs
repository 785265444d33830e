//! AES-GCM security barrier implementation

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::physical::{Backend, Entry};
use crate::{KEY_LENGTH, NONCE_LENGTH};

use super::keyring::{BarrierKey, Keyring};

/// Path of the encrypted keyring
pub const KEYRING_PATH: &str = "core/keyring";

/// Path of the keyring-encrypted master key copy, used by a newly
/// promoted leader to pick up a rekey performed elsewhere
pub const MASTER_KEY_PATH: &str = "core/master";

/// Prefix for key-term upgrade entries; the entry for term N+1 is
/// encrypted under the term-N key so standbys can walk the chain
pub const UPGRADE_PREFIX: &str = "core/upgrade/";

/// Ciphertext format version
const CIPHERTEXT_VERSION: u8 = 1;

/// term (4) + version (1) + nonce
const HEADER_LENGTH: usize = 4 + 1 + NONCE_LENGTH;

/// AES-GCM tag length
const TAG_LENGTH: usize = 16;

/// Authenticated-encryption view over a physical backend.
///
/// State machine: uninitialized (no keyring persisted), sealed (keyring
/// persisted but not in memory), unsealed (keyring in memory). Every
/// entry's ciphertext carries the term it was encrypted under and binds
/// the entry path as associated data.
pub struct AesGcmBarrier {
    backend: Arc<dyn Backend>,
    keyring: RwLock<Option<Keyring>>,
}

impl AesGcmBarrier {
    /// Create a barrier over `backend`, starting sealed
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            keyring: RwLock::new(None),
        }
    }

    /// Generate fresh AES-256 key material
    pub fn generate_key() -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(vec![0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Acceptable master key length range in bytes
    pub fn key_length(&self) -> (usize, usize) {
        (KEY_LENGTH, KEY_LENGTH)
    }

    /// Whether a keyring has ever been persisted
    pub async fn initialized(&self) -> Result<bool> {
        Ok(self.backend.get(KEYRING_PATH).await?.is_some())
    }

    /// Whether the barrier is currently sealed
    pub async fn sealed(&self) -> bool {
        self.keyring.read().await.is_none()
    }

    /// The active keyring term; fails when sealed
    pub async fn active_term(&self) -> Result<u32> {
        let keyring = self.keyring.read().await;
        Ok(keyring.as_ref().ok_or(Error::Sealed)?.active_term())
    }

    /// Create the keyring and persist it encrypted under `master_key`.
    ///
    /// The barrier stays sealed afterwards; callers unseal explicitly.
    pub async fn initialize(&self, master_key: &[u8]) -> Result<()> {
        let (min, max) = self.key_length();
        if master_key.len() < min || master_key.len() > max {
            return Err(Error::KeyLength(master_key.len()));
        }
        if self.initialized().await? {
            return Err(Error::AlreadyInit);
        }

        let initial = BarrierKey::new(1, Self::generate_key().to_vec());
        let keyring = Keyring::new(master_key.to_vec(), initial);

        self.persist_keyring(&keyring).await?;
        self.persist_master_key(&keyring).await?;
        info!("security barrier initialized");
        Ok(())
    }

    /// Decrypt the persisted keyring with `master_key` and go unsealed.
    ///
    /// A MAC mismatch surfaces as [`Error::InvalidKey`].
    pub async fn unseal(&self, master_key: &[u8]) -> Result<()> {
        let mut keyring = self.keyring.write().await;
        if keyring.is_some() {
            return Ok(());
        }

        let entry = self
            .backend
            .get(KEYRING_PATH)
            .await?
            .ok_or(Error::NotInit)?;

        let plaintext = Zeroizing::new(
            decrypt_with_key(KEYRING_PATH, master_key, &entry.value)
                .map_err(|_| Error::InvalidKey)?,
        );
        *keyring = Some(Keyring::deserialize(&plaintext)?);
        debug!("security barrier unsealed");
        Ok(())
    }

    /// Drop the in-memory keyring; key material is zeroized on drop
    pub async fn seal(&self) {
        let mut keyring = self.keyring.write().await;
        *keyring = None;
        debug!("security barrier sealed");
    }

    /// Fetch and decrypt an entry
    pub async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let keyring = self.keyring.read().await;
        let keyring = keyring.as_ref().ok_or(Error::Sealed)?;

        let Some(entry) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let plaintext = decrypt(key, keyring, &entry.value)?;
        Ok(Some(Entry::new(key, plaintext)))
    }

    /// Encrypt under the active term and persist
    pub async fn put(&self, entry: Entry) -> Result<()> {
        let keyring = self.keyring.read().await;
        let keyring = keyring.as_ref().ok_or(Error::Sealed)?;
        let active = keyring
            .active_key()
            .ok_or_else(|| Error::KeyTerm("active term has no key".to_string()))?;

        let ciphertext = encrypt_with_key(&entry.key, active.term, &active.value, &entry.value)?;
        self.backend.put(Entry::new(entry.key, ciphertext)).await
    }

    /// Delete an entry
    pub async fn delete(&self, key: &str) -> Result<()> {
        let keyring = self.keyring.read().await;
        if keyring.is_none() {
            return Err(Error::Sealed);
        }
        self.backend.delete(key).await
    }

    /// List keys under a prefix (keys themselves are not encrypted)
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keyring = self.keyring.read().await;
        if keyring.is_none() {
            return Err(Error::Sealed);
        }
        self.backend.list(prefix).await
    }

    /// Mint the next term, activate it, persist the keyring, and write
    /// the upgrade-chain entry so standbys on the previous term can
    /// catch up. Returns the new term.
    pub async fn rotate(&self) -> Result<u32> {
        let mut keyring = self.keyring.write().await;
        let keyring = keyring.as_mut().ok_or(Error::Sealed)?;

        let term = keyring.active_term() + 1;
        keyring.add_key(BarrierKey::new(term, Self::generate_key().to_vec()))?;
        keyring.set_active_term(term)?;
        self.persist_keyring(keyring).await?;
        self.write_upgrade_entry(keyring, term).await?;

        info!("barrier key rotated to term {}", term);
        Ok(term)
    }

    /// Write the chain entry for `term`, encrypted under the previous
    /// term's key so a standby on term N can decrypt term N+1
    async fn write_upgrade_entry(&self, keyring: &Keyring, term: u32) -> Result<()> {
        let new_key = keyring
            .term_key(term)
            .ok_or_else(|| Error::KeyTerm(format!("no key installed for term {}", term)))?;
        let prev_key = keyring
            .term_key(term - 1)
            .ok_or_else(|| Error::KeyTerm(format!("no key installed for term {}", term - 1)))?;

        let path = format!("{}{}", UPGRADE_PREFIX, term);
        let plaintext = Zeroizing::new(serde_json::to_vec(new_key)?);
        let ciphertext = encrypt_with_key(&path, prev_key.term, &prev_key.value, &plaintext)?;
        self.backend.put(Entry::new(path, ciphertext)).await
    }

    /// Check a reconstructed key against the live master key in
    /// constant time
    pub async fn verify_master(&self, master_key: &[u8]) -> Result<()> {
        let keyring = self.keyring.read().await;
        let keyring = keyring.as_ref().ok_or(Error::Sealed)?;
        if !bool::from(keyring.master_key().ct_eq(master_key)) {
            return Err(Error::InvalidKey);
        }
        Ok(())
    }

    /// Replace the master key, re-persisting the keyring and the
    /// master-key copy under it
    pub async fn rekey(&self, new_master_key: &[u8]) -> Result<()> {
        let (min, max) = self.key_length();
        if new_master_key.len() < min || new_master_key.len() > max {
            return Err(Error::KeyLength(new_master_key.len()));
        }

        let mut keyring = self.keyring.write().await;
        let keyring = keyring.as_mut().ok_or(Error::Sealed)?;
        keyring.set_master_key(new_master_key.to_vec());
        self.persist_keyring(keyring).await?;
        self.persist_master_key(keyring).await?;

        info!("barrier master key replaced");
        Ok(())
    }

    /// Delete the upgrade-chain entry for `term`
    pub async fn destroy_upgrade(&self, term: u32) -> Result<()> {
        let keyring = self.keyring.read().await;
        if keyring.is_none() {
            return Err(Error::Sealed);
        }
        self.backend
            .delete(&format!("{}{}", UPGRADE_PREFIX, term))
            .await
    }

    /// Check for a pending upgrade to the next term and apply it.
    ///
    /// Returns `(true, new_term)` when an upgrade was applied.
    pub async fn check_upgrade(&self) -> Result<(bool, u32)> {
        let mut keyring = self.keyring.write().await;
        let keyring = keyring.as_mut().ok_or(Error::Sealed)?;

        let next_term = keyring.active_term() + 1;
        let path = format!("{}{}", UPGRADE_PREFIX, next_term);
        let Some(entry) = self.backend.get(&path).await? else {
            return Ok((false, 0));
        };

        let plaintext = Zeroizing::new(decrypt(&path, keyring, &entry.value)?);
        let new_key: BarrierKey = serde_json::from_slice(&plaintext)?;
        if new_key.term != next_term {
            return Err(Error::KeyTerm(format!(
                "upgrade entry for term {} carries term {}",
                next_term, new_key.term
            )));
        }
        keyring.add_key(new_key)?;
        keyring.set_active_term(next_term)?;

        Ok((true, next_term))
    }

    /// Re-read the persisted keyring with the in-memory master key.
    /// Used by a newly promoted leader to pick up work a previous
    /// leader began.
    pub async fn reload_keyring(&self) -> Result<()> {
        let mut keyring = self.keyring.write().await;
        let master = Zeroizing::new(
            keyring
                .as_ref()
                .ok_or(Error::Sealed)?
                .master_key()
                .to_vec(),
        );

        let entry = self
            .backend
            .get(KEYRING_PATH)
            .await?
            .ok_or(Error::NotInit)?;
        let plaintext = Zeroizing::new(
            decrypt_with_key(KEYRING_PATH, &master, &entry.value)
                .map_err(|_| Error::InvalidKey)?,
        );
        *keyring = Some(Keyring::deserialize(&plaintext)?);
        Ok(())
    }

    /// Re-read the keyring-encrypted master key copy and swap it in
    pub async fn reload_master_key(&self) -> Result<()> {
        let mut keyring = self.keyring.write().await;
        let keyring = keyring.as_mut().ok_or(Error::Sealed)?;

        let Some(entry) = self.backend.get(MASTER_KEY_PATH).await? else {
            return Ok(());
        };
        let master = decrypt(MASTER_KEY_PATH, keyring, &entry.value)?;
        keyring.set_master_key(master);
        Ok(())
    }

    async fn persist_keyring(&self, keyring: &Keyring) -> Result<()> {
        let plaintext = Zeroizing::new(keyring.serialize()?);
        let ciphertext = encrypt_with_key(
            KEYRING_PATH,
            keyring.active_term(),
            keyring.master_key(),
            &plaintext,
        )?;
        self.backend
            .put(Entry::new(KEYRING_PATH, ciphertext))
            .await
    }

    async fn persist_master_key(&self, keyring: &Keyring) -> Result<()> {
        let active = keyring
            .active_key()
            .ok_or_else(|| Error::KeyTerm("active term has no key".to_string()))?;
        let ciphertext = encrypt_with_key(
            MASTER_KEY_PATH,
            active.term,
            &active.value,
            keyring.master_key(),
        )?;
        self.backend
            .put(Entry::new(MASTER_KEY_PATH, ciphertext))
            .await
    }
}

/// Encrypt `plaintext` under `key`, stamping `term` into the header and
/// binding `path` as associated data
fn encrypt_with_key(path: &str, term: u32, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("cipher setup failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: path.as_bytes(),
            },
        )
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(HEADER_LENGTH + ciphertext.len());
    out.extend_from_slice(&term.to_be_bytes());
    out.push(CIPHERTEXT_VERSION);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `data` with a specific key, ignoring the header term
fn decrypt_with_key(path: &str, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = parse_header(data)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("cipher setup failed: {}", e)))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: path.as_bytes(),
            },
        )
        .map_err(|_| Error::Crypto("ciphertext authentication failed".to_string()))
}

/// Decrypt `data` with the key named by its header term
fn decrypt(path: &str, keyring: &Keyring, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }
    let term = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let key = keyring
        .term_key(term)
        .ok_or_else(|| Error::KeyTerm(format!("no decryption key for term {}", term)))?;
    decrypt_with_key(path, &key.value, data)
}

fn parse_header(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < HEADER_LENGTH + TAG_LENGTH {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }
    if data[4] != CIPHERTEXT_VERSION {
        return Err(Error::Crypto(format!(
            "unsupported ciphertext version {}",
            data[4]
        )));
    }
    Ok((&data[5..HEADER_LENGTH], &data[HEADER_LENGTH..]))
}
