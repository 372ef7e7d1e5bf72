//! # Error Handling
//!
//! Error types for the flowmesh resource-synthesis core, built on `thiserror`.

/// Custom result type for flowmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for resource synthesis
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors: bad settings, incomplete client identity, unknown directions
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures reported by the service registry collaborator
    #[error("Registry error: {0}")]
    Registry(String),

    /// Protobuf decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry seed parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// True when the error stems from configuration rather than a collaborator
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
