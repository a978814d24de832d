//! Stratus server
//!
//! HTTP surface over the lifecycle service and the orchestration engine,
//! plus the server-side ambient pieces: env-var configuration and the
//! prometheus registry.

pub mod api;
pub mod config;
pub mod metrics;

pub use api::{build_router, AppState};
pub use config::{ConfigError, ServerConfig};
pub use metrics::MetricsRegistry;
