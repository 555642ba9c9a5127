//! Engine error model.
//!
//! `ConfigError` is raised before any warehouse I/O and returned to the
//! caller as `Err`. Everything else is a [`PipelineError`] that the
//! orchestrator folds into a failed `RunResult`.

use featurepipe_types::{ErrorKind, RunState};
use featurepipe_warehouse::WarehouseError;

use crate::config::FeatureType;

/// Configuration problems: bad references, cycles, schema mismatch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more semantic validation problems, all reported together.
    #[error("Pipeline validation failed:\n  - {}", .problems.join("\n  - "))]
    Invalid { problems: Vec<String> },

    #[error("Dependency cycle among features: {}", .members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("Feature '{feature}' references unresolved identifier '{identifier}'")]
    UnresolvedReference { feature: String, identifier: String },

    #[error(
        "Source '{source_name}' key column '{found}' does not match entity '{entity}' key column '{expected}'"
    )]
    KeyColumnMismatch {
        source_name: String,
        entity: String,
        expected: String,
        found: String,
    },

    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Feature '{feature}' belongs to entity '{found}' but the pipeline is keyed by '{expected}'")]
    EntityMismatch {
        feature: String,
        expected: String,
        found: String,
    },

    #[error("Feature '{0}' is already declared")]
    DuplicateFeature(String),

    #[error("Feature '{0}' has the same name as a source column")]
    AmbiguousName(String),

    #[error("Dependency '{dependency}' of feature '{feature}' is not materialized in {table}")]
    DependencyNotMaterialized {
        feature: String,
        dependency: String,
        table: String,
    },
}

/// Failures while computing feature values.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// A row lacked an input the transformation reads.
    #[error("Feature '{feature}': row with key {key} is missing required field '{field}'")]
    MissingInput {
        feature: String,
        key: String,
        field: String,
    },

    #[error("Feature '{feature}': field '{field}' for key {key} has type {found}, expected {expected}")]
    TypeMismatch {
        feature: String,
        key: String,
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Feature '{feature}': cannot coerce value '{value}' for key {key} to {target}")]
    Coercion {
        feature: String,
        key: String,
        value: String,
        target: FeatureType,
    },
}

/// Write or swap failures. The target table is unchanged whenever one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("Failed to write staging table {table}: {error}")]
    Staging {
        table: String,
        #[source]
        error: WarehouseError,
    },

    #[error("Failed to swap staging into {table}: {error}")]
    Swap {
        table: String,
        #[source]
        error: WarehouseError,
    },

    #[error("Failed to upsert into {table}: {error}")]
    Upsert {
        table: String,
        #[source]
        error: WarehouseError,
    },
}

/// Connection acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Could not connect to warehouse '{warehouse}' after {attempts} attempt(s): {last}")]
    Exhausted {
        warehouse: String,
        attempts: u32,
        #[source]
        last: WarehouseError,
    },

    #[error("Warehouse '{warehouse}' refused the connection: {error}")]
    Refused {
        warehouse: String,
        #[source]
        error: WarehouseError,
    },

    #[error("Connection pool is closed")]
    PoolClosed,
}

/// Any failure inside a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Failed to load source '{source_name}': {error}")]
    SourceLoad {
        source_name: String,
        #[source]
        error: WarehouseError,
    },

    #[error("Warehouse {operation} failed: {error}")]
    Warehouse {
        operation: &'static str,
        #[source]
        error: WarehouseError,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("{stage} validation failed with {blocking} blocking finding(s); first: {first}")]
    Validation {
        stage: &'static str,
        blocking: usize,
        first: String,
    },

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("Run cancelled before {0}")]
    Cancelled(RunState),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Classification carried in the run result.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Connection(_) => ErrorKind::Connection,
            Self::SourceLoad { .. } | Self::Warehouse { .. } => ErrorKind::Execution,
            Self::Executor(ExecutorError::MissingInput { .. }) => ErrorKind::MissingInput,
            Self::Executor(_) => ErrorKind::Execution,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Materialize(_) => ErrorKind::Materialization,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
