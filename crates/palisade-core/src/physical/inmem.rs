//! In-memory physical backend
//!
//! Reference backend used by tests and single-node development. The HA
//! variant shares one lock table across clones, so several cores wired
//! to clones of the same `InmemHaBackend` behave like a fleet sharing a
//! coordination backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

use crate::error::Result;

use super::{Backend, Entry, HaBackend, Lock, Transactional, TxnOp};

/// How often a contending lock re-checks the lock table
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// In-memory key/value backend
#[derive(Default)]
pub struct InmemBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InmemBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InmemBackend {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let data = self.data.read().await;
        Ok(data.get(key).map(|v| Entry::new(key, v.clone())))
    }

    async fn put(&self, entry: Entry) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(entry.key, entry.value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().await;
        let mut out: Vec<String> = Vec::new();
        for key in data.keys() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            // Fold nested entries into a single `dir/` result
            let item = match rest.find('/') {
                Some(idx) => &rest[..=idx],
                None => rest,
            };
            if out.last().map(String::as_str) != Some(item) {
                out.push(item.to_string());
            }
        }
        Ok(out)
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for InmemBackend {
    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        // Single write lock makes the batch atomic with respect to readers
        let mut data = self.data.write().await;
        for op in ops {
            match op {
                TxnOp::Put(entry) => {
                    data.insert(entry.key, entry.value);
                }
                TxnOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// One held lock in the shared table
struct HeldLock {
    holder: String,
    lost_tx: watch::Sender<bool>,
}

/// Lock table shared across clones of an [`InmemHaBackend`]
#[derive(Clone, Default)]
struct LockTable {
    inner: Arc<Mutex<HashMap<String, HeldLock>>>,
}

/// In-memory backend with HA lock support
#[derive(Clone)]
pub struct InmemHaBackend {
    backend: Arc<InmemBackend>,
    locks: LockTable,
}

impl InmemHaBackend {
    /// Create a fresh backend with an empty lock table
    pub fn new() -> Self {
        Self {
            backend: Arc::new(InmemBackend::new()),
            locks: LockTable::default(),
        }
    }

    /// The underlying storage, shared by all clones
    pub fn storage(&self) -> Arc<InmemBackend> {
        Arc::clone(&self.backend)
    }

    /// Fault injection: revoke the lock out from under its holder,
    /// firing the leader-lost channel the holder received at acquisition.
    pub async fn break_lock(&self, key: &str) {
        let mut locks = self.locks.inner.lock().await;
        if let Some(held) = locks.remove(key) {
            debug!("breaking in-memory lock for {}", key);
            let _ = held.lost_tx.send(true);
        }
    }
}

impl Default for InmemHaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InmemHaBackend {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.backend.get(key).await
    }

    async fn put(&self, entry: Entry) -> Result<()> {
        self.backend.put(entry).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.backend.list(prefix).await
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        self.backend.transactional()
    }
}

#[async_trait]
impl HaBackend for InmemHaBackend {
    fn ha_enabled(&self) -> bool {
        true
    }

    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        Ok(Box::new(InmemLock {
            table: self.locks.clone(),
            key: key.to_string(),
            value: value.to_string(),
            held: false,
        }))
    }
}

/// A single acquisition handle against the shared lock table
struct InmemLock {
    table: LockTable,
    key: String,
    value: String,
    held: bool,
}

#[async_trait]
impl Lock for InmemLock {
    async fn lock(&mut self, mut stop: watch::Receiver<bool>) -> Result<Option<watch::Receiver<bool>>> {
        loop {
            if *stop.borrow() {
                return Ok(None);
            }
            {
                let mut locks = self.table.inner.lock().await;
                if !locks.contains_key(&self.key) {
                    let (lost_tx, lost_rx) = watch::channel(false);
                    locks.insert(
                        self.key.clone(),
                        HeldLock {
                            holder: self.value.clone(),
                            lost_tx,
                        },
                    );
                    self.held = true;
                    return Ok(Some(lost_rx));
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
                _ = stop.changed() => {}
            }
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        let mut locks = self.table.inner.lock().await;
        if locks.get(&self.key).map(|h| h.holder == self.value) == Some(true) {
            if let Some(held) = locks.remove(&self.key) {
                let _ = held.lost_tx.send(true);
            }
        }
        self.held = false;
        Ok(())
    }

    async fn value(&self) -> Result<(bool, String)> {
        let locks = self.table.inner.lock().await;
        match locks.get(&self.key) {
            Some(held) => Ok((true, held.holder.clone())),
            None => Ok((false, String::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = InmemBackend::new();
        backend
            .put(Entry::new("core/test", b"value".to_vec()))
            .await
            .unwrap();

        let entry = backend.get("core/test").await.unwrap().unwrap();
        assert_eq!(entry.value, b"value");

        backend.delete("core/test").await.unwrap();
        assert!(backend.get("core/test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_folds_nested_keys() {
        let backend = InmemBackend::new();
        for key in ["core/leader/a", "core/leader/b", "core/lock", "core/sub/x/y"] {
            backend.put(Entry::new(key, vec![1])).await.unwrap();
        }

        let keys = backend.list("core/").await.unwrap();
        assert_eq!(keys, vec!["leader/", "lock", "sub/"]);

        let keys = backend.list("core/leader/").await.unwrap();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_transaction_applies_all_ops() {
        let backend = InmemBackend::new();
        backend.put(Entry::new("core/old", vec![1])).await.unwrap();

        let txn = backend.transactional().unwrap();
        txn.transaction(vec![
            TxnOp::Put(Entry::new("core/new", vec![2])),
            TxnOp::Delete("core/old".to_string()),
        ])
        .await
        .unwrap();

        assert!(backend.get("core/old").await.unwrap().is_none());
        assert_eq!(backend.get("core/new").await.unwrap().unwrap().value, vec![2]);
    }

    #[tokio::test]
    async fn test_lock_handoff() {
        let ha = InmemHaBackend::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut first = ha.lock_with("core/lock", "node-a").unwrap();
        let lost = first.lock(stop_rx.clone()).await.unwrap();
        assert!(lost.is_some());

        let (held, holder) = first.value().await.unwrap();
        assert!(held);
        assert_eq!(holder, "node-a");

        // Second acquirer blocks until the first releases
        let mut second = ha.lock_with("core/lock", "node-b").unwrap();
        let ha2 = ha.clone();
        let waiter = tokio::spawn(async move {
            let lost = second.lock(stop_rx).await.unwrap();
            assert!(lost.is_some());
            let (_, holder) = ha2.lock_with("core/lock", "probe").unwrap().value().await.unwrap();
            holder
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        first.unlock().await.unwrap();

        let holder = waiter.await.unwrap();
        assert_eq!(holder, "node-b");
    }

    #[tokio::test]
    async fn test_break_lock_fires_leader_lost() {
        let ha = InmemHaBackend::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut lock = ha.lock_with("core/lock", "node-a").unwrap();
        let mut lost = lock.lock(stop_rx).await.unwrap().unwrap();
        assert!(!*lost.borrow());

        ha.break_lock("core/lock").await;
        lost.changed().await.unwrap();
        assert!(*lost.borrow());
    }
}
