//! # Configuration Management
//!
//! Environment-driven configuration for resource synthesis and observability.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::domain::TlsMode;
use crate::xds::policy::BindPortPolicy;
use crate::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub xds: XdsConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config =
            Self { xds: XdsConfig::from_env()?, observability: ObservabilityConfig::from_env() };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.xds
            .validate()
            .map_err(|e| Error::config(format!("Invalid xDS configuration: {}", e)))?;
        self.observability
            .validate()
            .map_err(|e| Error::config(format!("Invalid observability configuration: {}", e)))?;
        Ok(())
    }
}

/// SDS secret names referenced by generated TLS contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TlsSecretConfig {
    /// Workload certificate and key
    #[validate(length(min = 1, message = "Certificate secret name cannot be empty"))]
    pub certificate_secret: String,

    /// Trust bundle used to validate peer certificates
    #[validate(length(min = 1, message = "Root CA secret name cannot be empty"))]
    pub root_ca_secret: String,
}

impl Default for TlsSecretConfig {
    fn default() -> Self {
        Self { certificate_secret: "default".to_string(), root_ca_secret: "ROOTCA".to_string() }
    }
}

/// Resource synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsConfig {
    /// Address generated listeners bind to
    #[validate(length(min = 1, message = "Listener address cannot be empty"))]
    pub listener_address: String,

    /// Direction to bind-port table
    #[validate(custom(function = "validate_bind_ports"))]
    pub bind_ports: BindPortPolicy,

    /// TLS mode applied when neither the node nor an override requests one
    pub default_tls_mode: TlsMode,

    #[validate(nested)]
    pub tls_secrets: TlsSecretConfig,

    #[validate(range(
        min = 1,
        max = 300,
        message = "Connect timeout must be between 1 and 300 seconds"
    ))]
    pub connect_timeout_seconds: u64,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            listener_address: "0.0.0.0".to_string(),
            bind_ports: BindPortPolicy::default(),
            default_tls_mode: TlsMode::None,
            tls_secrets: TlsSecretConfig::default(),
            connect_timeout_seconds: 5,
        }
    }
}

impl XdsConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let inbound_port =
            parse_port("FLOWMESH_INBOUND_PORT", BindPortPolicy::DEFAULT_INBOUND_PORT)?;
        let outbound_port =
            parse_port("FLOWMESH_OUTBOUND_PORT", BindPortPolicy::DEFAULT_OUTBOUND_PORT)?;

        let default_tls_mode = match std::env::var("FLOWMESH_DEFAULT_TLS_MODE") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.default_tls_mode,
        };

        let connect_timeout_seconds = match std::env::var("FLOWMESH_CONNECT_TIMEOUT_SECONDS") {
            Ok(value) => value
                .parse()
                .map_err(|e| Error::config(format!("Invalid connect timeout: {}", e)))?,
            Err(_) => defaults.connect_timeout_seconds,
        };

        Ok(Self {
            listener_address: std::env::var("FLOWMESH_LISTENER_ADDRESS")
                .unwrap_or(defaults.listener_address),
            bind_ports: BindPortPolicy::new(inbound_port, outbound_port),
            default_tls_mode,
            tls_secrets: TlsSecretConfig {
                certificate_secret: std::env::var("FLOWMESH_TLS_CERT_SECRET")
                    .unwrap_or(defaults.tls_secrets.certificate_secret),
                root_ca_secret: std::env::var("FLOWMESH_TLS_ROOT_CA_SECRET")
                    .unwrap_or(defaults.tls_secrets.root_ca_secret),
            },
            connect_timeout_seconds,
        })
    }
}

fn parse_port(var: &str, default: u32) -> Result<u32> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|e| Error::config(format!("Invalid {}: {}", var, e))),
        Err(_) => Ok(default),
    }
}

fn validate_bind_ports(ports: &BindPortPolicy) -> std::result::Result<(), ValidationError> {
    ports.check().map_err(|e| {
        let mut error = ValidationError::new("bind_ports");
        error.message = Some(e.to_string().into());
        error
    })
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        let log_level = std::env::var("FLOWMESH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let json_logging = std::env::var("FLOWMESH_JSON_LOGGING")
            .map(|s| s.to_lowercase() == "true" || s == "1")
            .unwrap_or(false);
        Self { log_level, json_logging }
    }
}
