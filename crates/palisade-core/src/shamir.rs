//! Shamir secret sharing wrapper
//!
//! Thin validation layer over the `sharks` GF(256) implementation. A
//! share is the 1-byte x-coordinate followed by one y-byte per secret
//! byte; callers account for [`SHARE_OVERHEAD`] when sizing buffers.

use rand::rngs::OsRng;
use sharks::{Share, Sharks};

use crate::error::{Error, Result};

/// Bytes a share carries beyond the secret length (the x-coordinate)
pub const SHARE_OVERHEAD: usize = 1;

/// Split `secret` into `shares` parts, any `threshold` of which recover it.
///
/// A threshold of one is rejected here; callers that allow it hand out
/// the unsplit secret instead of running the scheme.
pub fn split(secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Vec<u8>>> {
    if secret.is_empty() {
        return Err(Error::Crypto("cannot split an empty secret".to_string()));
    }
    if threshold < 2 {
        return Err(Error::Crypto(
            "threshold must be at least 2 to split".to_string(),
        ));
    }
    if shares < threshold {
        return Err(Error::Crypto(format!(
            "share count {} is less than threshold {}",
            shares, threshold
        )));
    }

    let sharks = Sharks(threshold);
    let dealer = sharks.dealer_rng(secret, &mut OsRng);
    Ok(dealer.take(shares as usize).map(|s| Vec::from(&s)).collect())
}

/// Recover a secret from `parts`.
///
/// With fewer than the original threshold of parts the interpolation is
/// underdetermined and yields garbage rather than an error; callers
/// detect that downstream (the barrier MAC rejects a wrong master key).
pub fn combine(parts: &[impl AsRef<[u8]>]) -> Result<Vec<u8>> {
    if parts.len() < 2 {
        return Err(Error::Crypto(
            "at least two shares are required to combine".to_string(),
        ));
    }

    let expected_len = parts[0].as_ref().len();
    if expected_len < 1 + SHARE_OVERHEAD {
        return Err(Error::Crypto("share is too short".to_string()));
    }

    let mut shares = Vec::with_capacity(parts.len());
    let mut seen_x = Vec::with_capacity(parts.len());
    for part in parts {
        let bytes = part.as_ref();
        if bytes.len() != expected_len {
            return Err(Error::Crypto("shares have mismatched lengths".to_string()));
        }
        if seen_x.contains(&bytes[0]) {
            return Err(Error::Crypto("duplicate share detected".to_string()));
        }
        seen_x.push(bytes[0]);
        let share =
            Share::try_from(bytes).map_err(|e| Error::Crypto(format!("malformed share: {}", e)))?;
        shares.push(share);
    }

    let sharks = Sharks(parts.len() as u8);
    sharks
        .recover(shares.iter())
        .map_err(|e| Error::Crypto(format!("failed to combine shares: {}", e)))
}
