//! # Structured Logging
//!
//! `tracing` subscriber setup plus span helpers. Log output is filtered with
//! `RUST_LOG` when set, otherwise with the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::{Config, ObservabilityConfig};
use crate::{Error, Result};

/// Create a tracing span for xDS operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $node_id:expr) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

fn env_filter(config: &ObservabilityConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e))),
    }
}

/// Install the global subscriber. Returns `Ok(false)` when one was already
/// installed (e.g. by a test harness); that is not an error.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<bool> {
    let filter = env_filter(config)?;

    let installed = if config.json_logging {
        tracing_subscriber::fmt().with_env_filter(filter).json().try_init().is_ok()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
    };

    Ok(installed)
}

/// Log configuration at startup
pub fn log_config_info(config: &Config) {
    tracing::info!(
        listener_address = %config.xds.listener_address,
        bind_ports = ?config.xds.bind_ports,
        default_tls_mode = %config.xds.default_tls_mode.as_str(),
        certificate_secret = %config.xds.tls_secrets.certificate_secret,
        root_ca_secret = %config.xds.tls_secrets.root_ca_secret,
        json_logging = config.observability.json_logging,
        "Flowmesh configuration"
    );
}
