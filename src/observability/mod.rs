//! # Observability
//!
//! Structured logging for the resource-synthesis core: subscriber
//! initialisation and the span macros used around snapshot generation.

pub mod logging;

pub use logging::{init_tracing, log_config_info};
