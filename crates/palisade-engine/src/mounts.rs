//! Mount tables
//!
//! The mount table names the secret engines mounted at each path; the
//! credential table does the same for auth methods. Both are protected
//! configuration: they live behind the barrier and are only loaded
//! after unseal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use palisade_core::{AesGcmBarrier, Entry};

use crate::error::{Error, Result};

/// Path of the secret engine mount table
pub const MOUNT_TABLE_PATH: &str = "core/mounts";

/// Path of the credential (auth method) table
pub const AUTH_TABLE_PATH: &str = "core/auth";

/// Storage prefix handed to a mounted engine, keyed by mount uuid
pub const ENGINE_VIEW_PREFIX: &str = "logical/";

/// Storage prefix handed to a credential backend, keyed by mount uuid
pub const CREDENTIAL_VIEW_PREFIX: &str = "auth/";

/// One mounted backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mount path, always `/`-terminated
    pub path: String,

    /// Backend type, e.g. `kv` or `token`
    #[serde(rename = "type")]
    pub entry_type: String,

    /// Operator-provided description
    pub description: String,

    /// Stable id; names the engine's storage prefix
    pub uuid: String,
}

impl MountEntry {
    /// Create an entry with a fresh uuid
    pub fn new(
        path: impl Into<String>,
        entry_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            entry_type: entry_type.into(),
            description: description.into(),
            uuid: Uuid::new_v4().to_string(),
        }
    }
}

/// An ordered set of mount entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountTable {
    /// The mounts, in mount order
    pub entries: Vec<MountEntry>,
}

impl MountTable {
    /// The table installed on first unseal: a default key/value engine
    /// plus the system backend
    pub fn default_mounts() -> Self {
        Self {
            entries: vec![
                MountEntry::new("kv/", "kv", "key/value secret storage"),
                MountEntry::new("sys/", "system", "system endpoints used for control, policy and debugging"),
            ],
        }
    }

    /// The credential table installed on first unseal
    pub fn default_credentials() -> Self {
        Self {
            entries: vec![MountEntry::new("token/", "token", "token based credentials")],
        }
    }

    /// Look up the entry mounted at `path`
    pub fn get(&self, path: &str) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Check structural invariants: `/`-terminated, unique paths
    pub fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            if !entry.path.ends_with('/') {
                return Err(Error::Config(format!(
                    "mount path {:?} must end with '/'",
                    entry.path
                )));
            }
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if self.entries[..i].iter().any(|e| e.path == entry.path) {
                return Err(Error::Config(format!(
                    "duplicate mount path {:?}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

/// Load a mount table from the barrier, `None` if not yet persisted
pub async fn load_table(barrier: &AesGcmBarrier, path: &str) -> Result<Option<MountTable>> {
    let Some(entry) = barrier.get(path).await? else {
        return Ok(None);
    };
    let table: MountTable = serde_json::from_slice(&entry.value)?;
    table.validate()?;
    Ok(Some(table))
}

/// Persist a mount table through the barrier
pub async fn persist_table(barrier: &AesGcmBarrier, path: &str, table: &MountTable) -> Result<()> {
    table.validate()?;
    let value = serde_json::to_vec(table)?;
    barrier.put(Entry::new(path, value)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::physical::InmemBackend;
    use palisade_core::Backend;
    use std::sync::Arc;

    #[test]
    fn test_validate_catches_bad_tables() {
        let mut table = MountTable::default_mounts();
        assert!(table.validate().is_ok());

        table.entries.push(MountEntry::new("kv/", "kv", "duplicate"));
        assert!(table.validate().is_err());

        let mut table = MountTable::default_mounts();
        table.entries.push(MountEntry::new("nope", "kv", "unterminated"));
        assert!(table.validate().is_err());
    }

    #[tokio::test]
    async fn test_table_roundtrip() {
        let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
        let barrier = AesGcmBarrier::new(backend);
        let master = AesGcmBarrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        assert!(load_table(&barrier, MOUNT_TABLE_PATH).await.unwrap().is_none());

        let table = MountTable::default_mounts();
        persist_table(&barrier, MOUNT_TABLE_PATH, &table).await.unwrap();

        let loaded = load_table(&barrier, MOUNT_TABLE_PATH).await.unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert!(loaded.get("kv/").is_some());
        assert_eq!(loaded.get("sys/").unwrap().entry_type, "system");
    }
}
