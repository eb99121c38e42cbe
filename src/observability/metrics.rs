//! # Metrics Collection
//!
//! Counters and histograms for secret mutations and reference expansion.
//! Until [`init_metrics`] installs a recorder the `metrics` macros are no-ops,
//! so library callers that do not care about metrics pay nothing.

use crate::config::ObservabilityConfig;
use crate::errors::{KeyplaneError, Result};
use ::tracing::info;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Metrics recorder that tracks secret core metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a committed bulk mutation (`insert`, `update`, `delete`, `move`)
    pub fn record_secret_mutation(&self, operation: &'static str, count: usize) {
        counter!("secret_mutations_total", "operation" => operation).increment(count as u64);
    }

    /// Record a completed expansion call
    pub fn record_expansion(&self, references_followed: usize, duration_seconds: f64) {
        counter!("secret_expansions_total").increment(1);
        histogram!("secret_expansion_references").record(references_followed as f64);
        histogram!("secret_expansion_duration_seconds").record(duration_seconds);
    }

    /// Record a frame dropped because it exceeded the depth bound
    pub fn record_depth_limit_hit(&self) {
        counter!("secret_expansion_depth_limit_total").increment(1);
    }

    /// Record a reference substituted as a leaf because of a cycle
    pub fn record_circular_reference(&self) {
        counter!("secret_expansion_circular_total").increment(1);
    }

    /// Record an advisory side effect (reminder, snapshot, sync) that failed
    pub fn record_side_effect_failure(&self, kind: &'static str) {
        counter!("secret_side_effect_failures_total", "kind" => kind).increment(1);
    }

    fn describe(&self) {
        describe_counter!("secret_mutations_total", Unit::Count, "Secrets written by bulk operations");
        describe_counter!("secret_expansions_total", Unit::Count, "Reference expansion calls");
        describe_histogram!(
            "secret_expansion_references",
            Unit::Count,
            "References followed per expansion call"
        );
        describe_histogram!(
            "secret_expansion_duration_seconds",
            Unit::Seconds,
            "Wall time of one expansion call"
        );
        describe_counter!(
            "secret_expansion_depth_limit_total",
            Unit::Count,
            "Expansion frames dropped at the depth bound"
        );
        describe_counter!(
            "secret_expansion_circular_total",
            Unit::Count,
            "References substituted as leaves because of a cycle"
        );
        describe_counter!(
            "secret_side_effect_failures_total",
            Unit::Count,
            "Advisory side effects that failed"
        );
    }
}

/// Install the Prometheus recorder and return its render handle.
///
/// Returns `Ok(None)` when metrics are disabled in configuration.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    if !config.enable_metrics {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", &config.service_name)
        .install_recorder()
        .map_err(|e| {
            KeyplaneError::config(format!("Failed to initialize metrics recorder: {}", e))
        })?;

    MetricsRecorder::new().describe();

    info!(service_name = %config.service_name, "Metrics collection initialized");

    Ok(Some(handle))
}
