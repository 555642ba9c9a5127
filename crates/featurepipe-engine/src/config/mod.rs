//! Pipeline configuration: types, YAML parsing and semantic validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use types::{
    AggregateFunction, ArithmeticOp, Entity, FeatureDefinition, FeatureType, Operand,
    PipelineDefaults, PipelineSpec, SourceSystem, SourceTable, Transformation, ValidationConfig,
    WarehouseBackend, WarehouseConfig,
};
