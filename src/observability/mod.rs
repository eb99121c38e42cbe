//! # Observability Infrastructure
//!
//! Structured logging and metrics for the keyplane secret core.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LOG_FILTER_ENV};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;
use metrics_exporter_prometheus::PrometheusHandle;

/// Initialize logging and, when enabled, the metrics recorder
pub fn init_observability(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    init_logging(config)?;
    let handle = init_metrics(config)?;

    info!(
        service_name = %config.service_name,
        metrics_enabled = config.enable_metrics,
        "Observability initialized successfully"
    );

    Ok(handle)
}
