//! # Structured Logging
//!
//! Provides the subscriber setup and span macros used across the crate.
//!
//! The filter is read from `KEYPLANE_LOG` when present (standard `EnvFilter`
//! directives) and otherwise falls back to the configured log level.

use crate::config::ObservabilityConfig;
use crate::errors::{KeyplaneError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding `EnvFilter` directives
pub const LOG_FILTER_ENV: &str = "KEYPLANE_LOG";

/// Create a tracing span for database operations.
///
/// ```rust,ignore
/// let span = db_span!("bulk_insert_secrets", folder_id = %folder_id);
/// ```
#[macro_export]
macro_rules! db_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for one logical secret operation.
///
/// ```rust,ignore
/// let span = secret_span!("move_secrets", "dev", "/app");
/// ```
#[macro_export]
macro_rules! secret_span {
    ($operation:expr, $environment:expr, $secret_path:expr) => {
        tracing::info_span!(
            "secret_operation",
            operation = %$operation,
            environment = %$environment,
            secret_path = %$secret_path,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $environment:expr, $secret_path:expr, $($field:tt)*) => {
        tracing::info_span!(
            "secret_operation",
            operation = %$operation,
            environment = %$environment,
            secret_path = %$secret_path,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global tracing subscriber.
///
/// Fails with a configuration error if a global subscriber is already set.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            KeyplaneError::config(format!("Invalid log level '{}': {}", config.log_level, e))
        })?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| {
        KeyplaneError::config_with_source("Failed to install tracing subscriber", Box::new(e))
    })?;

    tracing::info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = db_span!("insert_secrets");
        let _span = db_span!("insert_secrets", table = "secrets");
        let _span = secret_span!("expand", "dev", "/");
        let _span = secret_span!("expand", "dev", "/", secret_key = "API_KEY");
    }

    #[test]
    fn test_init_logging_rejects_second_install() {
        let config = ObservabilityConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        // Another test may already have installed a subscriber, but two
        // installs can never both succeed.
        assert!(first.is_err() || second.is_err());
    }
}
