//! BatchLoop common library
//!
//! This crate contains shared code used across BatchLoop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{ApiSpec, BatchingConfig, RoutineKind, ServerConfig};
pub use error::{BatchLoopError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
