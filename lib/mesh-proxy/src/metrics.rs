//! Prometheus metrics for the proxy data plane

use anyhow::Result;
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Forward outcome labels
pub const OUTCOME_FORWARDED: &str = "forwarded";
pub const OUTCOME_UNLINKED: &str = "unlinked";
pub const OUTCOME_BACKEND_ERROR: &str = "backend_error";

/// Counters shared by every proxy handler of a process
#[derive(Clone)]
pub struct ProxyMetrics {
    /// Forward attempts by proxy and outcome
    pub proxy_requests_total: CounterVec,
    /// Backend responses relayed, by proxy and status
    pub proxy_responses_total: CounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl ProxyMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a metrics collector registered into an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let proxy_requests_total = CounterVec::new(
            Opts::new("proxy_requests_total", "Forward attempts by outcome"),
            &["proxy", "outcome"],
        )?;

        let proxy_responses_total = CounterVec::new(
            Opts::new("proxy_responses_total", "Backend responses relayed by status"),
            &["proxy", "status"],
        )?;

        registry.register(Box::new(proxy_requests_total.clone()))?;
        registry.register(Box::new(proxy_responses_total.clone()))?;

        Ok(Self {
            proxy_requests_total,
            proxy_responses_total,
            registry,
        })
    }

    pub fn record_outcome(&self, proxy: &str, outcome: &str) {
        self.proxy_requests_total
            .with_label_values(&[proxy, outcome])
            .inc();
    }

    pub fn record_status(&self, proxy: &str, status: u16) {
        self.proxy_responses_total
            .with_label_values(&[proxy, &status.to_string()])
            .inc();
    }

    /// Count recorded for one proxy and outcome
    pub fn outcome_count(&self, proxy: &str, outcome: &str) -> u64 {
        self.proxy_requests_total
            .with_label_values(&[proxy, outcome])
            .get() as u64
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
