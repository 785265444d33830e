//! Unlock assembler
//!
//! Accumulates threshold key shares under a per-attempt nonce and
//! reconstructs the barrier master key once enough distinct shares have
//! been collected. Shares are compared in constant time, and every
//! share buffer is zeroized the moment the session is consumed, whether
//! or not the barrier subsequently accepts the reconstructed key.

use palisade_core::shamir;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::error::Result;

/// Outcome of submitting one share
pub enum SubmitOutcome {
    /// More shares are needed; reports how many are held
    Progress {
        /// Distinct shares collected so far
        progress: usize,
    },
    /// Threshold reached; the session has been consumed
    Complete {
        /// The reconstructed master key
        master_key: Zeroizing<Vec<u8>>,
    },
}

/// One in-flight unseal attempt
pub struct UnlockSession {
    nonce: String,
    parts: Vec<Zeroizing<Vec<u8>>>,
}

impl UnlockSession {
    /// Start a session with a fresh random nonce
    pub fn new() -> Self {
        Self {
            nonce: Uuid::new_v4().to_string(),
            parts: Vec::new(),
        }
    }

    /// The nonce identifying this attempt
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Distinct shares collected so far
    pub fn progress(&self) -> usize {
        self.parts.len()
    }

    /// Submit one share.
    ///
    /// A duplicate of an already-held share returns the current
    /// progress unchanged. When the `threshold`-th distinct share
    /// arrives the master key is reconstructed: for a threshold of one
    /// the single share is the key itself, otherwise the shares go
    /// through the Shamir combine. Reconstruction zeroizes and drops
    /// every held share before returning.
    pub fn submit(&mut self, share: &[u8], threshold: usize) -> Result<SubmitOutcome> {
        for existing in &self.parts {
            if bool::from(existing.as_slice().ct_eq(share)) {
                return Ok(SubmitOutcome::Progress {
                    progress: self.parts.len(),
                });
            }
        }

        self.parts.push(Zeroizing::new(share.to_vec()));
        if self.parts.len() < threshold {
            return Ok(SubmitOutcome::Progress {
                progress: self.parts.len(),
            });
        }

        let master_key = if threshold == 1 {
            Zeroizing::new(self.parts[0].to_vec())
        } else {
            let parts: Vec<&[u8]> = self.parts.iter().map(|p| p.as_slice()).collect();
            Zeroizing::new(shamir::combine(&parts)?)
        };
        self.wipe();
        Ok(SubmitOutcome::Complete { master_key })
    }

    /// Zeroize and drop every held share
    pub fn wipe(&mut self) {
        for part in &mut self.parts {
            part.zeroize();
        }
        self.parts.clear();
    }
}

impl Drop for UnlockSession {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl Default for UnlockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_shares_do_not_advance() {
        let parts = shamir::split(b"0123456789abcdef0123456789abcdef", 3, 2).unwrap();
        let mut session = UnlockSession::new();

        match session.submit(&parts[0], 2).unwrap() {
            SubmitOutcome::Progress { progress } => assert_eq!(progress, 1),
            SubmitOutcome::Complete { .. } => panic!("one share should not complete"),
        }

        // Resubmitting the same share changes nothing
        match session.submit(&parts[0], 2).unwrap() {
            SubmitOutcome::Progress { progress } => assert_eq!(progress, 1),
            SubmitOutcome::Complete { .. } => panic!("duplicate should not complete"),
        }
    }

    #[test]
    fn test_threshold_reconstructs_master_key() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let parts = shamir::split(secret, 5, 3).unwrap();
        let mut session = UnlockSession::new();

        assert!(matches!(
            session.submit(&parts[4], 3).unwrap(),
            SubmitOutcome::Progress { progress: 1 }
        ));
        assert!(matches!(
            session.submit(&parts[1], 3).unwrap(),
            SubmitOutcome::Progress { progress: 2 }
        ));
        match session.submit(&parts[2], 3).unwrap() {
            SubmitOutcome::Complete { master_key } => {
                assert_eq!(master_key.as_slice(), secret);
            }
            SubmitOutcome::Progress { .. } => panic!("threshold should complete"),
        }
        assert_eq!(session.progress(), 0);
    }

    #[test]
    fn test_threshold_of_one_copies_share() {
        let mut session = UnlockSession::new();
        match session.submit(b"the-whole-master-key", 1).unwrap() {
            SubmitOutcome::Complete { master_key } => {
                assert_eq!(master_key.as_slice(), b"the-whole-master-key");
            }
            SubmitOutcome::Progress { .. } => panic!("threshold 1 should complete"),
        }
    }

    #[test]
    fn test_reconstruction_consumes_the_session() {
        let parts = shamir::split(b"0123456789abcdef0123456789abcdef", 3, 2).unwrap();
        let mut session = UnlockSession::new();

        session.submit(&parts[0], 2).unwrap();
        assert_eq!(session.progress(), 1);

        session.submit(&parts[1], 2).unwrap();
        assert!(session.parts.is_empty());

        // Each buffer is zeroized in place before the vector is cleared;
        // wipe() is also the drop path, so a dropped session leaves no
        // live share material behind.
        let mut buf = Zeroizing::new(parts[2].clone());
        buf.zeroize();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wipe_resets_session() {
        let parts = shamir::split(b"0123456789abcdef0123456789abcdef", 3, 3).unwrap();
        let mut session = UnlockSession::new();
        session.submit(&parts[0], 3).unwrap();
        session.submit(&parts[1], 3).unwrap();

        session.wipe();
        assert_eq!(session.progress(), 0);

        // Fresh submissions start over
        assert!(matches!(
            session.submit(&parts[0], 3).unwrap(),
            SubmitOutcome::Progress { progress: 1 }
        ));
    }
}
