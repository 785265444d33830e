//! Core metrics
//!
//! Prometheus registry owning the engine gauges. The metrics emitter
//! (one of the periodic workers) refreshes the lease gauge from the
//! expiration manager each tick; the state gauges flip at seal/unseal
//! and leadership transitions.

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

/// Engine gauges registered on a dedicated registry.
///
/// Gauges are registered at construction; registration of freshly
/// created collectors on a fresh registry cannot collide.
pub struct CoreMetrics {
    registry: Registry,

    sealed: IntGauge,
    standby: IntGauge,
    unseal_progress: IntGauge,
    lease_count: IntGauge,
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreMetrics {
    /// Create the registry and register every gauge
    pub fn new() -> Self {
        let registry = Registry::new();

        let sealed = IntGauge::with_opts(Opts::new(
            "palisade_core_sealed",
            "Whether the barrier is sealed (1) or unsealed (0)",
        ))
        .unwrap();
        registry.register(Box::new(sealed.clone())).unwrap();

        let standby = IntGauge::with_opts(Opts::new(
            "palisade_core_standby",
            "Whether the node is a standby (1) or active (0)",
        ))
        .unwrap();
        registry.register(Box::new(standby.clone())).unwrap();

        let unseal_progress = IntGauge::with_opts(Opts::new(
            "palisade_core_unseal_progress",
            "Distinct unseal shares collected in the current attempt",
        ))
        .unwrap();
        registry.register(Box::new(unseal_progress.clone())).unwrap();

        let lease_count = IntGauge::with_opts(Opts::new(
            "palisade_expire_num_leases",
            "Number of live leases tracked by the expiration manager",
        ))
        .unwrap();
        registry.register(Box::new(lease_count.clone())).unwrap();

        // Fresh cores start sealed and in standby
        sealed.set(1);
        standby.set(1);

        Self {
            registry,
            sealed,
            standby,
            unseal_progress,
            lease_count,
        }
    }

    pub fn set_sealed(&self, sealed: bool) {
        self.sealed.set(i64::from(sealed));
    }

    pub fn set_standby(&self, standby: bool) {
        self.standby.set(i64::from(standby));
    }

    pub fn set_unseal_progress(&self, progress: usize) {
        self.unseal_progress.set(progress as i64);
    }

    pub fn set_lease_count(&self, count: usize) {
        self.lease_count.set(count as i64);
    }

    /// The registry, for embedding in a larger exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the current values in the text exposition format
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
