//! Audit broker and audited-headers configuration
//!
//! The broker fans each privileged request out to every enabled audit
//! device. Logging happens before the request is enacted, and a device
//! failure blocks the request: an action that cannot be audited does
//! not happen.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use palisade_core::{AesGcmBarrier, Entry};

use crate::contracts::{AuditBackend, Auth, Request};
use crate::error::{Error, Result};

/// Path of the audit device table
pub const AUDIT_TABLE_PATH: &str = "core/audit";

/// Path of the audited-headers configuration
pub const AUDITED_HEADERS_PATH: &str = "core/audited-headers-config";

/// Storage prefix handed to an audit device, keyed by mount uuid
pub const AUDIT_VIEW_PREFIX: &str = "audit/";

/// Fan-out over the enabled audit devices
#[derive(Default)]
pub struct AuditBroker {
    backends: Vec<(String, Arc<dyn AuditBackend>)>,
}

impl AuditBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its mount path
    pub fn register(&mut self, path: impl Into<String>, backend: Arc<dyn AuditBackend>) {
        self.backends.push((path.into(), backend));
    }

    /// Number of enabled devices
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether any devices are enabled
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Record a request with every device. With no devices enabled this
    /// succeeds trivially; with devices enabled, every one must accept
    /// the record.
    pub async fn log_request(&self, auth: &Auth, req: &Request) -> Result<()> {
        for (path, backend) in &self.backends {
            if let Err(e) = backend.log_request(auth, req).await {
                error!("audit device {} failed to log request: {}", path, e);
                return Err(Error::Audit(format!("audit device {} failed", path)));
            }
        }
        Ok(())
    }
}

/// Which HTTP headers the audit devices record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditedHeadersConfig {
    /// Lower-cased header names
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Load the audited-headers configuration, empty when absent
pub async fn load_audited_headers(barrier: &AesGcmBarrier) -> Result<AuditedHeadersConfig> {
    let Some(entry) = barrier.get(AUDITED_HEADERS_PATH).await? else {
        return Ok(AuditedHeadersConfig::default());
    };
    Ok(serde_json::from_slice(&entry.value)?)
}

/// Persist the audited-headers configuration
pub async fn persist_audited_headers(
    barrier: &AesGcmBarrier,
    config: &AuditedHeadersConfig,
) -> Result<()> {
    let value = serde_json::to_vec(config)?;
    barrier.put(Entry::new(AUDITED_HEADERS_PATH, value)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Operation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAudit {
        logged: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AuditBackend for CountingAudit {
        async fn log_request(&self, _auth: &Auth, _req: &Request) -> Result<()> {
            if self.fail {
                return Err(Error::Internal);
            }
            self.logged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn root_auth() -> Auth {
        Auth {
            client_token: "token".to_string(),
            display_name: "root".to_string(),
            policies: vec!["root".to_string()],
            root: true,
        }
    }

    #[tokio::test]
    async fn test_empty_broker_accepts() {
        let broker = AuditBroker::new();
        let req = Request::new(Operation::Update, "sys/seal", "token");
        broker.log_request(&root_auth(), &req).await.unwrap();
    }

    #[tokio::test]
    async fn test_any_device_failure_blocks() {
        let good = Arc::new(CountingAudit {
            logged: AtomicUsize::new(0),
            fail: false,
        });
        let mut broker = AuditBroker::new();
        broker.register("file/", Arc::clone(&good) as Arc<dyn AuditBackend>);
        broker.register(
            "syslog/",
            Arc::new(CountingAudit {
                logged: AtomicUsize::new(0),
                fail: true,
            }) as Arc<dyn AuditBackend>,
        );

        let req = Request::new(Operation::Update, "sys/seal", "token");
        let result = broker.log_request(&root_auth(), &req).await;
        assert!(matches!(result, Err(Error::Audit(_))));
        assert_eq!(good.logged.load(Ordering::SeqCst), 1);
    }
}
