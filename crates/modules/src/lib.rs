//! Stratus modules
//!
//! The two moving parts of the control plane, plus the acceptance surface in
//! front of them:
//!
//! - [`executor`]: the step pipeline executor driving single lifecycle
//!   operations through their kind-specific step sequences.
//! - [`orchestration`]: the engine resolving batch-upgrade requests into
//!   member operations and supervising them.
//! - [`lifecycle`]: the service that validates and records incoming
//!   lifecycle actions.

pub mod executor;
pub mod lifecycle;
pub mod orchestration;

pub use executor::{ExecutorConfig, ExecutorContext, StepExecutor};
pub use lifecycle::{LifecycleError, LifecycleService};
pub use orchestration::{OrchestrationConfig, OrchestrationEngine, OrchestrationError};
