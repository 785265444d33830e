//! CORS configuration
//!
//! Stored behind the barrier and loaded during post-unseal so the HTTP
//! layer outside the engine can consult it.

use serde::{Deserialize, Serialize};

use palisade_core::{AesGcmBarrier, Entry};

use crate::error::Result;

/// Path of the persisted CORS configuration
pub const CORS_CONFIG_PATH: &str = "core/cors-config";

/// Cross-origin request policy for the API surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Whether CORS handling is enabled at all
    pub enabled: bool,

    /// Origins allowed to make cross-origin requests
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Headers allowed on cross-origin requests
    #[serde(default)]
    pub allowed_headers: Vec<String>,
}

impl CorsConfig {
    /// Whether `origin` is permitted
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.allowed_origins
            .iter()
            .any(|o| o == "*" || o == origin)
    }
}

/// Load the CORS configuration, defaulting to disabled when absent
pub async fn load_cors_config(barrier: &AesGcmBarrier) -> Result<CorsConfig> {
    let Some(entry) = barrier.get(CORS_CONFIG_PATH).await? else {
        return Ok(CorsConfig::default());
    };
    Ok(serde_json::from_slice(&entry.value)?)
}

/// Persist the CORS configuration
pub async fn persist_cors_config(barrier: &AesGcmBarrier, config: &CorsConfig) -> Result<()> {
    let value = serde_json::to_vec(config)?;
    barrier.put(Entry::new(CORS_CONFIG_PATH, value)).await?;
    Ok(())
}
