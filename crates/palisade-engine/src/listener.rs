//! Cluster RPC listener supervision
//!
//! The forwarding transport itself lives outside the engine; this
//! module owns the lifecycle contract around it: the listener starts
//! last in post-unseal (network comes up only after storage and
//! subsystems), stops early in pre-seal, and shutdown is acknowledged
//! before binds could be reinstated.

use tracing::{debug, info};

use crate::lifecycle::WorkerHandle;

/// Handle to the running cluster listener task
pub struct ClusterListener {
    addr: String,
    handle: WorkerHandle,
}

impl ClusterListener {
    /// Start the listener for `cluster_addr`
    pub fn start(cluster_addr: &str) -> Self {
        let addr = cluster_addr.to_string();
        info!("starting cluster listener on {}", addr);

        let task_addr = addr.clone();
        let handle = WorkerHandle::spawn(move |mut stop| async move {
            // The accept loop is provided by the embedding transport;
            // this task anchors its lifetime to the active epoch
            let _ = stop.changed().await;
            debug!("cluster listener on {} shutting down", task_addr);
        });

        Self { addr, handle }
    }

    /// The address the listener was started for
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop the listener and wait for the shutdown acknowledgement
    pub async fn stop(self) {
        self.handle.stop().await;
        info!("cluster listener on {} stopped", self.addr);
    }
}
