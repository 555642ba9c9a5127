//! Feature pipeline engine: configuration model, dependency resolution,
//! execution, validation, materialization and run orchestration.

pub mod arrow;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod executor;
pub mod materialize;
pub mod orchestrator;
pub mod resolve;
pub mod result;
pub mod validate;

// Re-export public API for convenience
pub use config::PipelineSpec;
pub use connection::{open_warehouse, ConnectionManager, RetryPolicy};
pub use error::{ConfigError, PipelineError};
pub use execution::{Clock, FixedClock, RunOptions, RunRequest, SystemClock};
pub use orchestrator::{plan, Orchestrator, RunPlan};
pub use resolve::ExecutionPlan;
pub use result::RunResult;
