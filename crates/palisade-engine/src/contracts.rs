//! Contracts with external collaborators
//!
//! The engine drives token verification, audit devices, secret engines,
//! and credential backends through the narrow traits in this module; it
//! never holds their implementations. Subsystems receive a
//! [`StorageView`] scoped to their prefix instead of a reference to the
//! core itself, which keeps them independently testable and breaks the
//! core/subsystem reference cycle.

use std::sync::Arc;

use async_trait::async_trait;
use palisade_core::{AesGcmBarrier, Entry};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mounts::MountEntry;

/// Operation kind for an audited operator request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Update,
    Delete,
    List,
}

/// An operator request as seen by the engine boundary
#[derive(Debug, Clone)]
pub struct Request {
    /// Operation kind
    pub operation: Operation,
    /// Logical path, e.g. `sys/seal`
    pub path: String,
    /// The presented client token
    pub client_token: String,
}

impl Request {
    /// Create a request
    pub fn new(operation: Operation, path: impl Into<String>, client_token: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            client_token: client_token.into(),
        }
    }
}

/// The verified identity behind a request, as reported by the token
/// layer and recorded by the audit broker
#[derive(Debug, Clone)]
pub struct Auth {
    /// The token the caller presented
    pub client_token: String,
    /// Display name of the principal
    pub display_name: String,
    /// Policies attached to the principal
    pub policies: Vec<String>,
    /// Whether the principal carries root privileges
    pub root: bool,
}

/// Token verification contract.
///
/// The token store lives outside the engine; this is the slice of it the
/// lifecycle paths need: verify a token for a request, and mint the
/// first root principal during initialization.
#[async_trait]
pub trait AuthBroker: Send + Sync {
    /// Verify the request's token. Unknown or empty tokens fail with
    /// [`Error::PermissionDenied`].
    async fn check(&self, req: &Request) -> Result<Auth>;

    /// Create the initial root principal and return its token
    async fn bootstrap_root(&self) -> Result<String>;
}

/// Minimal broker holding a single root token in memory.
///
/// The open-core default; embedders with a real token store replace it.
#[derive(Default)]
pub struct StaticRootBroker {
    token: RwLock<Option<String>>,
}

impl StaticRootBroker {
    /// Create an empty broker; `bootstrap_root` mints the token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker that accepts a fixed token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

#[async_trait]
impl AuthBroker for StaticRootBroker {
    async fn check(&self, req: &Request) -> Result<Auth> {
        if req.client_token.is_empty() {
            return Err(Error::PermissionDenied);
        }
        let token = self.token.read().await;
        let Some(token) = token.as_deref() else {
            return Err(Error::PermissionDenied);
        };
        if !bool::from(token.as_bytes().ct_eq(req.client_token.as_bytes())) {
            return Err(Error::PermissionDenied);
        }
        Ok(Auth {
            client_token: req.client_token.clone(),
            display_name: "root".to_string(),
            policies: vec!["root".to_string()],
            root: true,
        })
    }

    async fn bootstrap_root(&self) -> Result<String> {
        let minted = Uuid::new_v4().to_string();
        let mut token = self.token.write().await;
        *token = Some(minted.clone());
        Ok(minted)
    }
}

/// An enabled audit device
#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Record a request and the identity behind it. A failure here
    /// blocks the request from being enacted.
    async fn log_request(&self, auth: &Auth, req: &Request) -> Result<()>;
}

/// Creates audit devices from their persisted table entries
#[async_trait]
pub trait AuditFactory: Send + Sync {
    async fn create(&self, entry: &MountEntry, view: StorageView) -> Result<Arc<dyn AuditBackend>>;
}

/// A mounted secret engine or credential backend, as far as the
/// lifecycle is concerned: it can be rolled back periodically and torn
/// down at seal
#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// Periodic maintenance tick driven by the rollback manager
    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources; runs during pre-seal
    async fn teardown(&self) {}
}

/// Creates engine backends from their mount table entries
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, entry: &MountEntry, view: StorageView) -> Result<Arc<dyn EngineBackend>>;
}

/// Default `kv` engine: plain storage through its view, nothing to
/// roll back or tear down
pub struct PassthroughFactory;

struct PassthroughEngine {
    _view: StorageView,
}

#[async_trait]
impl EngineBackend for PassthroughEngine {}

#[async_trait]
impl EngineFactory for PassthroughFactory {
    async fn create(&self, _entry: &MountEntry, view: StorageView) -> Result<Arc<dyn EngineBackend>> {
        Ok(Arc::new(PassthroughEngine { _view: view }))
    }
}

/// A lifecycle extension point; runs inside post-unseal (in order) and
/// pre-seal (in reverse). Open-core builds register none.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Hook name, for logs and error context
    fn name(&self) -> &str;

    /// Runs during post-unseal; an error aborts activation
    async fn post_unseal(&self) -> Result<()>;

    /// Runs during pre-seal; errors are accumulated, not short-circuited
    async fn pre_seal(&self) -> Result<()>;
}

/// Barrier access scoped under a path prefix.
///
/// This is the capability object handed to subsystems at setup; it is
/// the only way they touch storage.
#[derive(Clone)]
pub struct StorageView {
    barrier: Arc<AesGcmBarrier>,
    prefix: String,
}

impl StorageView {
    /// Create a view over `prefix` (must end with `/`)
    pub fn new(barrier: Arc<AesGcmBarrier>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        debug_assert!(prefix.ends_with('/'));
        Self { barrier, prefix }
    }

    fn full_key(&self, key: &str) -> Result<String> {
        if key.contains("..") {
            return Err(Error::Config(format!("invalid storage key: {}", key)));
        }
        Ok(format!("{}{}", self.prefix, key))
    }

    /// Fetch an entry relative to the view prefix
    pub async fn get(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self.barrier.get(&self.full_key(key)?).await?)
    }

    /// Write an entry relative to the view prefix
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = self.full_key(key)?;
        Ok(self.barrier.put(Entry::new(key, value)).await?)
    }

    /// Delete a key relative to the view prefix
    pub async fn delete(&self, key: &str) -> Result<()> {
        Ok(self.barrier.delete(&self.full_key(key)?).await?)
    }

    /// List keys relative to the view prefix
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.barrier.list(&self.full_key(prefix)?).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_root_broker_checks_token() {
        let broker = StaticRootBroker::new();
        let token = broker.bootstrap_root().await.unwrap();

        let req = Request::new(Operation::Update, "sys/seal", token);
        let auth = broker.check(&req).await.unwrap();
        assert!(auth.root);

        let bad = Request::new(Operation::Update, "sys/seal", "not-the-token");
        assert!(matches!(
            broker.check(&bad).await,
            Err(Error::PermissionDenied)
        ));

        let empty = Request::new(Operation::Update, "sys/seal", "");
        assert!(matches!(
            broker.check(&empty).await,
            Err(Error::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_unbootstrapped_broker_denies_everything() {
        let broker = StaticRootBroker::new();
        let req = Request::new(Operation::Update, "sys/seal", "anything");
        assert!(broker.check(&req).await.is_err());
    }
}
