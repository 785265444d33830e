//! Policy store
//!
//! Named ACL policies persisted behind the barrier. The evaluator lives
//! outside the engine; the store only guarantees the built-in policies
//! exist and round-trips documents for the evaluator to consume.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contracts::StorageView;
use crate::error::{Error, Result};

/// Storage prefix for named policies, relative to the barrier root
pub const POLICY_PREFIX: &str = "sys/policy/";

/// Built-in policy granting nothing; attached to every token
pub const DEFAULT_POLICY_NAME: &str = "default";

/// Built-in policy granting everything; cannot be modified
pub const ROOT_POLICY_NAME: &str = "root";

const DEFAULT_POLICY_RULES: &str = r#"path "sys/mounts" { capabilities = ["read"] }"#;

#[derive(Serialize, Deserialize)]
struct StoredPolicy {
    name: String,
    rules: String,
}

/// Store for named policy documents
pub struct PolicyStore {
    view: StorageView,
}

impl PolicyStore {
    /// Create a store over its storage view
    pub fn new(view: StorageView) -> Self {
        Self { view }
    }

    /// Ensure the built-in policies exist
    pub async fn setup(&self) -> Result<()> {
        if self.view.get(DEFAULT_POLICY_NAME).await?.is_none() {
            self.set_policy(DEFAULT_POLICY_NAME, DEFAULT_POLICY_RULES)
                .await?;
            debug!("installed default policy");
        }
        if self.view.get(ROOT_POLICY_NAME).await?.is_none() {
            // The root policy has no rules; it is special-cased by the
            // evaluator
            self.set_policy(ROOT_POLICY_NAME, "").await?;
            debug!("installed root policy");
        }
        Ok(())
    }

    /// Fetch a policy document by name
    pub async fn get_policy(&self, name: &str) -> Result<Option<String>> {
        let Some(entry) = self.view.get(name).await? else {
            return Ok(None);
        };
        let stored: StoredPolicy = serde_json::from_slice(&entry.value)?;
        Ok(Some(stored.rules))
    }

    /// Create or replace a policy document
    pub async fn set_policy(&self, name: &str, rules: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config("policy name cannot be empty".to_string()));
        }
        let stored = StoredPolicy {
            name: name.to_string(),
            rules: rules.to_string(),
        };
        self.view.put(name, serde_json::to_vec(&stored)?).await
    }

    /// Delete a policy; the built-ins are protected
    pub async fn delete_policy(&self, name: &str) -> Result<()> {
        if name == ROOT_POLICY_NAME || name == DEFAULT_POLICY_NAME {
            return Err(Error::Config(format!(
                "cannot delete built-in policy {:?}",
                name
            )));
        }
        self.view.delete(name).await
    }

    /// List policy names
    pub async fn list_policies(&self) -> Result<Vec<String>> {
        self.view.list("").await
    }
}
