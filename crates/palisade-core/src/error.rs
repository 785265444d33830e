//! Error types for the Palisade foundations

use thiserror::Error;

/// Result type alias using the foundation error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage and barrier layers
#[derive(Debug, Error)]
pub enum Error {
    /// The barrier keyring already exists
    #[error("barrier is already initialized")]
    AlreadyInit,

    /// The barrier keyring does not exist yet
    #[error("barrier is not initialized")]
    NotInit,

    /// Operation requires an unsealed barrier
    #[error("barrier is sealed")]
    Sealed,

    /// The supplied master key failed to authenticate the keyring
    #[error("unseal failed, invalid key")]
    InvalidKey,

    /// Cryptographic failure (cipher setup, MAC mismatch on an entry)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Persisted record failed to encode or decode
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Physical backend operation failed
    #[error("backend error: {0}")]
    Backend(String),

    /// A key did not meet the barrier length requirements
    #[error("key length {0} is outside the supported range")]
    KeyLength(usize),

    /// A keyring term violated the upgrade chain invariants
    #[error("invalid key term: {0}")]
    KeyTerm(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
