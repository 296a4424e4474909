//! Reconciler metrics
//!
//! Prometheus collectors registered on a private registry so several
//! reconcilers (and tests) can coexist in one process.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Collectors updated by every pass
pub struct ReconcilerMetrics {
    registry: Registry,
    pub passes_total: IntCounter,
    pub pass_failures_total: IntCounter,
    pub pass_duration_seconds: Histogram,
    pub store_writes_total: IntCounterVec,
    pub object_failures_total: IntCounterVec,
    pub managed_instances: IntGauge,
    pub managed_shares: IntGauge,
}

impl ReconcilerMetrics {
    /// Create and register all collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("multishare_reconciler".into()), None)
            .map_err(metrics_error)?;

        let passes_total = IntCounter::new("passes_total", "Reconciliation passes started")
            .map_err(metrics_error)?;
        let pass_failures_total =
            IntCounter::new("pass_failures_total", "Passes aborted by a fatal error")
                .map_err(metrics_error)?;
        let pass_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "pass_duration_seconds",
            "Wall time of one reconciliation pass",
        ))
        .map_err(metrics_error)?;
        let store_writes_total = IntCounterVec::new(
            Opts::new("store_writes_total", "Writes issued to the record store"),
            &["kind", "operation"],
        )
        .map_err(metrics_error)?;
        let object_failures_total = IntCounterVec::new(
            Opts::new("object_failures_total", "Objects skipped because of an error"),
            &["component"],
        )
        .map_err(metrics_error)?;
        let managed_instances =
            IntGauge::new("managed_instances", "Live instances owned by this cluster")
                .map_err(metrics_error)?;
        let managed_shares = IntGauge::new("managed_shares", "Live shares owned by this cluster")
            .map_err(metrics_error)?;

        registry.register(Box::new(passes_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(pass_failures_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(pass_duration_seconds.clone())).map_err(metrics_error)?;
        registry.register(Box::new(store_writes_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(object_failures_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(managed_instances.clone())).map_err(metrics_error)?;
        registry.register(Box::new(managed_shares.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            passes_total,
            pass_failures_total,
            pass_duration_seconds,
            store_writes_total,
            object_failures_total,
            managed_instances,
            managed_shares,
        })
    }

    /// Count a store write
    pub fn record_write(&self, kind: &str, operation: &str) {
        self.store_writes_total.with_label_values(&[kind, operation]).inc();
    }

    /// Count a skipped object
    pub fn record_failure(&self, component: &str) {
        self.object_failures_total.with_label_values(&[component]).inc();
    }

    /// Render the text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
