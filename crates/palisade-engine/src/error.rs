//! Error types for the lifecycle engine
//!
//! Operator and state errors are surfaced verbatim; storage and crypto
//! failures are logged with context where they occur and collapse into
//! the opaque [`Error::Internal`] so no backend detail leaks across the
//! operator boundary.

use thiserror::Error;
use tracing::error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine
#[derive(Debug, Error)]
pub enum Error {
    /// The core is already initialized
    #[error("already initialized")]
    AlreadyInit,

    /// The core has not been initialized
    #[error("not initialized")]
    NotInit,

    /// Operation requires an unsealed core
    #[error("the barrier is sealed")]
    Sealed,

    /// Operation requires the active node
    #[error("node is in standby mode")]
    Standby,

    /// Sealing a standby is refused; there is no live token store to
    /// authorize it
    #[error("cannot seal when in standby mode; please restart the process instead")]
    StandbySeal,

    /// Operation only makes sense with an HA backend configured
    #[error("high-availability mode is not enabled")]
    HaNotEnabled,

    /// Operator-correctable problem with a provided unseal key
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Safe to show to the operator
        reason: String,
    },

    /// The presented token does not carry the required privileges
    #[error("permission denied")]
    PermissionDenied,

    /// A privileged request could not be audited, so it was not enacted
    #[error("failed to audit request, cannot continue: {0}")]
    Audit(String),

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Opaque internal failure; details are in the logs only
    #[error("internal error")]
    Internal,

    /// Startup failure that does not prevent using the core
    #[error("non-fatal error: {0}")]
    NonFatal(Box<Error>),

    /// Several independent failures, accumulated during teardown
    #[error("{}", join_errors(.0))]
    Multi(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<palisade_core::Error> for Error {
    fn from(e: palisade_core::Error) -> Self {
        use palisade_core::Error as CoreError;
        match e {
            CoreError::AlreadyInit => Error::AlreadyInit,
            CoreError::NotInit => Error::NotInit,
            CoreError::Sealed => Error::Sealed,
            CoreError::InvalidKey => Error::InvalidKey {
                reason: "unseal failed, invalid key".to_string(),
            },
            other => {
                error!("storage layer failure: {}", other);
                Error::Internal
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        error!("serialization failure: {}", e);
        Error::Internal
    }
}
