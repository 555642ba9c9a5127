//! Shared featurepipe value, table, run-status and error-kind types.
//!
//! This crate performs no I/O so the warehouse backends and the engine can
//! share it without circular dependencies.

pub mod error;
pub mod run;
pub mod table;
pub mod value;

pub use error::{ErrorKind, Finding, Severity};
pub use run::{MaterializeMode, PipelineId, RunMode, RunState, RunStatus};
pub use table::{RowSet, TableRef};
pub use value::{Row, Value};
