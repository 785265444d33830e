//! End-to-end lifecycle tests for a single (non-HA) core:
//! initialization, threshold unseal, authorized seal, and the ordering
//! guarantees between post-unseal and pre-seal.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use palisade_core::physical::InmemBackend;
use palisade_core::Backend;
use palisade_engine::contracts::Operation;
use palisade_engine::{
    Core, CoreConfig, Error, InitParams, LifecycleHook, Request, Result, StaticRootBroker,
};

struct RecordingHook {
    name: String,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LifecycleHook for RecordingHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post_unseal(&self) -> Result<()> {
        self.events.lock().await.push(format!("post:{}", self.name));
        Ok(())
    }

    async fn pre_seal(&self) -> Result<()> {
        self.events.lock().await.push(format!("pre:{}", self.name));
        Ok(())
    }
}

struct TestNode {
    core: Arc<Core>,
    shares: Vec<Vec<u8>>,
    root_token: String,
    events: Arc<Mutex<Vec<String>>>,
}

/// Build an initialized, still-sealed core with recording hooks
async fn new_test_node(shares: u32, threshold: u32) -> TestNode {
    let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut config = CoreConfig::new(backend);
    config.auth = Some(Arc::new(StaticRootBroker::new()));
    for name in ["alpha", "beta"] {
        config.hooks.push(Arc::new(RecordingHook {
            name: name.to_string(),
            events: Arc::clone(&events),
        }));
    }

    let (core, non_fatal) = Core::new(config).await.unwrap();
    assert!(non_fatal.is_none());

    let result = core
        .initialize(InitParams {
            secret_shares: shares,
            secret_threshold: threshold,
            pgp_keys: None,
        })
        .await
        .unwrap();

    TestNode {
        core,
        shares: result.secret_shares,
        root_token: result.root_token,
        events,
    }
}

#[tokio::test]
async fn test_initialize_basics() {
    let node = new_test_node(3, 2).await;
    assert_eq!(node.shares.len(), 3);
    assert!(node.core.initialized().await.unwrap());
    assert!(node.core.sealed().await);
    assert!(node.core.standby().await);

    // Re-initialization is refused
    let err = node
        .core
        .initialize(InitParams {
            secret_shares: 3,
            secret_threshold: 2,
            pgp_keys: None,
        })
        .await;
    assert!(matches!(err, Err(Error::AlreadyInit)));
}

#[tokio::test]
async fn test_unseal_before_initialize_fails() {
    let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
    let (core, _) = Core::new(CoreConfig::new(backend)).await.unwrap();

    let err = core.unseal(&[0x41; 33]).await;
    assert!(matches!(err, Err(Error::NotInit)));
}

#[tokio::test]
async fn test_duplicate_share_does_not_advance_progress() {
    let node = new_test_node(3, 2).await;

    // share1
    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    let (progress, nonce) = node.core.secret_progress().await;
    assert_eq!(progress, 1);
    assert!(!nonce.is_empty());

    // share1 again: progress and nonce unchanged
    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    let (progress, nonce_after) = node.core.secret_progress().await;
    assert_eq!(progress, 1);
    assert_eq!(nonce, nonce_after);

    // share2 completes: sealed=false, standby=false, session destroyed
    assert!(node.core.unseal(&node.shares[1]).await.unwrap());
    assert!(!node.core.sealed().await);
    assert!(!node.core.standby().await);
    assert_eq!(node.core.secret_progress().await, (0, String::new()));
}

#[tokio::test]
async fn test_any_threshold_subset_unseals() {
    let node = new_test_node(3, 2).await;

    // share1 and share3 (any 2 of 3 work)
    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    assert!(node.core.unseal(&node.shares[2]).await.unwrap());
    assert!(!node.core.sealed().await);
}

#[tokio::test]
async fn test_share_length_window_is_enforced() {
    let node = new_test_node(3, 2).await;

    let err = node.core.unseal(&[]).await;
    assert!(matches!(err, Err(Error::InvalidKey { .. })));

    let err = node.core.unseal(&[0x41; 4]).await;
    assert!(matches!(err, Err(Error::InvalidKey { .. })));

    let err = node.core.unseal(&[0x41; 64]).await;
    assert!(matches!(err, Err(Error::InvalidKey { .. })));

    // Nothing above created a session
    assert_eq!(node.core.secret_progress().await.0, 0);
}

#[tokio::test]
async fn test_garbage_shares_leave_core_sealed_and_destroy_session() {
    let node = new_test_node(3, 2).await;

    // Right length, wrong content: reconstruction yields a garbage
    // master key that the barrier MAC rejects
    let mut bogus_a = node.shares[0].clone();
    bogus_a[1] ^= 0xff;
    let mut bogus_b = node.shares[1].clone();
    bogus_b[1] ^= 0xff;

    assert!(!node.core.unseal(&bogus_a).await.unwrap());
    let err = node.core.unseal(&bogus_b).await;
    assert!(matches!(err, Err(Error::InvalidKey { .. })));
    assert!(node.core.sealed().await);

    // The session was consumed; the operator starts over
    assert_eq!(node.core.secret_progress().await.0, 0);

    // And real shares still work afterwards
    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    assert!(node.core.unseal(&node.shares[1]).await.unwrap());
    assert!(!node.core.sealed().await);
}

#[tokio::test]
async fn test_reset_unseal_discards_progress() {
    let node = new_test_node(3, 2).await;

    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    assert_eq!(node.core.secret_progress().await.0, 1);

    node.core.reset_unseal().await;
    assert_eq!(node.core.secret_progress().await.0, 0);

    // A fresh attempt gets a fresh nonce and still works
    assert!(!node.core.unseal(&node.shares[1]).await.unwrap());
    assert!(node.core.unseal(&node.shares[2]).await.unwrap());
}

#[tokio::test]
async fn test_seal_requires_root_token() {
    let node = new_test_node(3, 2).await;
    node.core.unseal(&node.shares[0]).await.unwrap();
    node.core.unseal(&node.shares[1]).await.unwrap();

    let err = node.core.seal("not-the-root-token").await;
    assert!(matches!(err, Err(Error::PermissionDenied)));
    assert!(!node.core.sealed().await);

    node.core.seal(&node.root_token).await.unwrap();
    assert!(node.core.sealed().await);
    assert!(node.core.standby().await);
}

#[tokio::test]
async fn test_seal_cancels_outstanding_requests() {
    let node = new_test_node(3, 2).await;
    node.core.unseal(&node.shares[0]).await.unwrap();
    node.core.unseal(&node.shares[1]).await.unwrap();

    // A long-running request holds the activation scope
    let mut scope = node.core.request_scope().await.unwrap();
    assert!(!*scope.borrow());

    node.core.seal(&node.root_token).await.unwrap();

    // The scope was cancelled before teardown
    scope.changed().await.unwrap();
    assert!(*scope.borrow());
    assert!(node.core.sealed().await);

    // Post-seal, there is no activation scope to join
    assert!(node.core.request_scope().await.is_none());
}

#[tokio::test]
async fn test_lifecycle_hooks_run_in_reverse_on_seal() {
    let node = new_test_node(3, 2).await;
    node.core.unseal(&node.shares[0]).await.unwrap();
    node.core.unseal(&node.shares[1]).await.unwrap();
    node.core.seal(&node.root_token).await.unwrap();

    let events = node.events.lock().await.clone();
    assert_eq!(
        events,
        vec!["post:alpha", "post:beta", "pre:beta", "pre:alpha"]
    );
}

#[tokio::test]
async fn test_reseal_and_reunseal_cycle() {
    let node = new_test_node(5, 3).await;

    for _ in 0..2 {
        assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
        assert!(!node.core.unseal(&node.shares[2]).await.unwrap());
        assert!(node.core.unseal(&node.shares[4]).await.unwrap());
        assert!(!node.core.sealed().await);

        node.core.seal(&node.root_token).await.unwrap();
        assert!(node.core.sealed().await);
    }

    // Two full activations, each with a full reverse teardown
    let events = node.events.lock().await.clone();
    assert_eq!(
        events,
        vec![
            "post:alpha",
            "post:beta",
            "pre:beta",
            "pre:alpha",
            "post:alpha",
            "post:beta",
            "pre:beta",
            "pre:alpha",
        ]
    );
}

#[tokio::test]
async fn test_rotate_requires_root_and_advances_term() {
    let node = new_test_node(3, 2).await;

    // A sealed core refuses rotation outright
    let req = Request::new(Operation::Update, "sys/rotate", node.root_token.clone());
    assert!(matches!(node.core.rotate(req).await, Err(Error::Sealed)));

    node.core.unseal(&node.shares[0]).await.unwrap();
    node.core.unseal(&node.shares[1]).await.unwrap();
    assert_eq!(node.core.barrier().active_term().await.unwrap(), 1);

    let bad = Request::new(Operation::Update, "sys/rotate", "not-the-root-token");
    assert!(matches!(
        node.core.rotate(bad).await,
        Err(Error::PermissionDenied)
    ));

    let req = Request::new(Operation::Update, "sys/rotate", node.root_token.clone());
    let term = node.core.rotate(req).await.unwrap();
    assert_eq!(term, 2);
    assert_eq!(node.core.barrier().active_term().await.unwrap(), 2);

    // Entries written under the old term stay readable
    assert!(node
        .core
        .barrier()
        .get("core/mounts")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_rekey_issues_new_shares_and_retires_old() {
    let node = new_test_node(3, 2).await;
    node.core.unseal(&node.shares[0]).await.unwrap();
    node.core.unseal(&node.shares[1]).await.unwrap();

    // No attempt in flight yet
    assert!(node.core.rekey_progress().await.is_none());
    assert!(node.core.rekey_update(&node.shares[0]).await.is_err());

    let nonce = node
        .core
        .rekey_init(InitParams {
            secret_shares: 5,
            secret_threshold: 3,
            pgp_keys: None,
        })
        .await
        .unwrap();
    assert_eq!(node.core.rekey_progress().await, Some((0, nonce)));

    // Only one attempt at a time
    assert!(node
        .core
        .rekey_init(InitParams {
            secret_shares: 2,
            secret_threshold: 2,
            pgp_keys: None,
        })
        .await
        .is_err());

    // The current threshold (2) of existing shares completes the rekey
    assert!(node
        .core
        .rekey_update(&node.shares[2])
        .await
        .unwrap()
        .is_none());
    assert_eq!(node.core.rekey_progress().await.map(|(n, _)| n), Some(1));
    let result = node
        .core
        .rekey_update(&node.shares[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.secret_shares.len(), 5);
    assert!(node.core.rekey_progress().await.is_none());

    // The new split is live: any 3 of the 5 new shares unseal
    node.core.seal(&node.root_token).await.unwrap();
    assert!(!node.core.unseal(&result.secret_shares[4]).await.unwrap());
    assert!(!node.core.unseal(&result.secret_shares[1]).await.unwrap());
    assert!(node.core.unseal(&result.secret_shares[2]).await.unwrap());
    assert!(!node.core.sealed().await);

    // The old shares reconstruct the retired master key and are refused
    node.core.seal(&node.root_token).await.unwrap();
    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    assert!(!node.core.unseal(&node.shares[1]).await.unwrap());
    let err = node.core.unseal(&node.shares[2]).await;
    assert!(matches!(err, Err(Error::InvalidKey { .. })));
    assert!(node.core.sealed().await);

    // And a sealed core refuses a new attempt
    assert!(matches!(
        node.core
            .rekey_init(InitParams {
                secret_shares: 3,
                secret_threshold: 2,
                pgp_keys: None,
            })
            .await,
        Err(Error::Sealed)
    ));
}

#[tokio::test]
async fn test_rekey_cancel_discards_the_attempt() {
    let node = new_test_node(3, 2).await;
    node.core.unseal(&node.shares[0]).await.unwrap();
    node.core.unseal(&node.shares[1]).await.unwrap();

    node.core
        .rekey_init(InitParams {
            secret_shares: 5,
            secret_threshold: 3,
            pgp_keys: None,
        })
        .await
        .unwrap();
    node.core.rekey_update(&node.shares[0]).await.unwrap();

    node.core.rekey_cancel().await;
    assert!(node.core.rekey_progress().await.is_none());
    assert!(node.core.rekey_update(&node.shares[1]).await.is_err());

    // The original shares still unseal after a canceled attempt
    node.core.seal(&node.root_token).await.unwrap();
    assert!(!node.core.unseal(&node.shares[0]).await.unwrap());
    assert!(node.core.unseal(&node.shares[1]).await.unwrap());
}

#[tokio::test]
async fn test_privileged_requests_are_audited_before_enacting() {
    use palisade_engine::audit::AUDIT_TABLE_PATH;
    use palisade_engine::contracts::{AuditBackend, AuditFactory, Auth, StorageView};
    use palisade_engine::mounts::{self, MountEntry};

    struct MemoryAudit {
        records: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AuditBackend for MemoryAudit {
        async fn log_request(&self, auth: &Auth, req: &Request) -> Result<()> {
            self.records
                .lock()
                .await
                .push(format!("{} by {}", req.path, auth.display_name));
            Ok(())
        }
    }

    struct MemoryAuditFactory {
        records: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AuditFactory for MemoryAuditFactory {
        async fn create(
            &self,
            _entry: &MountEntry,
            _view: StorageView,
        ) -> Result<Arc<dyn AuditBackend>> {
            Ok(Arc::new(MemoryAudit {
                records: Arc::clone(&self.records),
            }))
        }
    }

    let backend = Arc::new(InmemBackend::new()) as Arc<dyn Backend>;
    let records = Arc::new(Mutex::new(Vec::new()));

    let mut config = CoreConfig::new(backend);
    config.audit_factories.insert(
        "memory".to_string(),
        Arc::new(MemoryAuditFactory {
            records: Arc::clone(&records),
        }) as Arc<dyn AuditFactory>,
    );

    let (core, _) = Core::new(config).await.unwrap();
    let init = core
        .initialize(InitParams {
            secret_shares: 1,
            secret_threshold: 1,
            pgp_keys: None,
        })
        .await
        .unwrap();

    // First activation: enable an audit device, then recycle so the
    // table is loaded with the device attached
    core.unseal(&init.secret_shares[0]).await.unwrap();
    let mut table = mounts::load_table(core.barrier(), AUDIT_TABLE_PATH)
        .await
        .unwrap()
        .unwrap();
    assert!(table.entries.is_empty());
    table
        .entries
        .push(MountEntry::new("memory/", "memory", "in-memory audit"));
    mounts::persist_table(core.barrier(), AUDIT_TABLE_PATH, &table)
        .await
        .unwrap();
    core.seal(&init.root_token).await.unwrap();
    assert!(records.lock().await.is_empty());

    core.unseal(&init.secret_shares[0]).await.unwrap();
    core.seal(&init.root_token).await.unwrap();

    let records = records.lock().await.clone();
    assert_eq!(records, vec!["sys/seal by root"]);
}
