//! Pipeline configuration model: entities, source tables, features and
//! pipeline defaults. Created once from YAML and read-only thereafter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use featurepipe_types::{MaterializeMode, Severity, TableRef};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PARTITION_COLUMN: &str = "event_time";
pub const DEFAULT_OUTPUT_FORMAT: &str = "parquet";

/// A real-world object features are defined around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub key_column: String,
}

/// Where a logical source lives in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSystem {
    #[serde(default)]
    pub system_name: Option<String>,
    /// Connection / namespace the backing table lives under (e.g. `hive_crm`).
    pub connection: String,
    pub table: String,
}

/// A source relation the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    /// Logical name, looked up in `source_systems`.
    pub source: String,
    pub key_column: String,
    pub required_columns: Vec<String>,
    /// Entity this source feeds; defaults to the pipeline entity.
    #[serde(default)]
    pub entity: Option<String>,
}

/// Declared output type of a feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    #[default]
    #[serde(alias = "float", alias = "FLOAT", alias = "NUMERIC")]
    Numeric,
    #[serde(alias = "int", alias = "INT", alias = "INTEGER")]
    Integer,
    #[serde(alias = "STRING")]
    String,
    #[serde(alias = "DATE")]
    Date,
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Numeric => "numeric",
            Self::Integer => "integer",
            Self::String => "string",
            Self::Date => "date",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Mean,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
        })
    }
}

/// Arithmetic operand: a numeric literal or a column / feature name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Literal(f64),
    Column(String),
}

/// The closed set of transformation primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transformation {
    /// `numerator / denominator`.
    Ratio {
        numerator: String,
        denominator: String,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Operand,
        right: Operand,
    },
    /// Whole days from `column` to the run's as-of date.
    DateDiff { column: String },
    /// Aggregate over the group, broadcast to every key in it.
    Aggregate {
        function: AggregateFunction,
        column: String,
        #[serde(default)]
        group_by: Option<String>,
    },
    /// Aggregate divided by the group's `max(date_column) - min(date_column)` in days.
    GroupedAggregateRatio {
        function: AggregateFunction,
        column: String,
        date_column: String,
        #[serde(default)]
        group_by: Option<String>,
    },
}

impl Transformation {
    /// Column or feature names this transformation reads, deduplicated in
    /// first-use order.
    #[must_use]
    pub fn references(&self) -> Vec<&str> {
        fn push<'a>(name: &'a str, refs: &mut Vec<&'a str>) {
            if !refs.contains(&name) {
                refs.push(name);
            }
        }

        let mut refs: Vec<&str> = Vec::new();
        match self {
            Self::Ratio {
                numerator,
                denominator,
            } => {
                push(numerator, &mut refs);
                push(denominator, &mut refs);
            }
            Self::Arithmetic { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Column(name) = operand {
                        push(name, &mut refs);
                    }
                }
            }
            Self::DateDiff { column } => push(column, &mut refs),
            Self::Aggregate {
                column, group_by, ..
            } => {
                push(column, &mut refs);
                if let Some(group) = group_by {
                    push(group, &mut refs);
                }
            }
            Self::GroupedAggregateRatio {
                column,
                date_column,
                group_by,
                ..
            } => {
                push(column, &mut refs);
                push(date_column, &mut refs);
                if let Some(group) = group_by {
                    push(group, &mut refs);
                }
            }
        }
        refs
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Ratio { .. } => "ratio",
            Self::Arithmetic { .. } => "arithmetic",
            Self::DateDiff { .. } => "date_diff",
            Self::Aggregate { .. } => "aggregate",
            Self::GroupedAggregateRatio { .. } => "grouped_aggregate_ratio",
        }
    }
}

/// A named derived column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub name: String,
    /// Owning entity; defaults to the pipeline entity.
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(rename = "type", default)]
    pub feature_type: FeatureType,
    pub transformation: Transformation,
    /// Explicit feature dependencies in addition to those implied by the
    /// transformation's references.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Project-wide fallbacks for per-pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefaults {
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

fn default_partition_column() -> String {
    DEFAULT_PARTITION_COLUMN.to_string()
}

fn default_output_format() -> String {
    DEFAULT_OUTPUT_FORMAT.to_string()
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            partition_column: default_partition_column(),
            output_format: default_output_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Warehouse connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub backend: WarehouseBackend,
    /// Database location for file-backed warehouses.
    #[serde(default)]
    pub path: Option<String>,
    /// Upper bound on concurrently open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    4
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            backend: WarehouseBackend::default(),
            path: None,
            max_connections: default_max_connections(),
            connect_attempts: default_connect_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Data-quality thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub min_row_count: Option<u64>,
    #[serde(default)]
    pub max_row_count: Option<u64>,
    #[serde(default)]
    pub row_count_severity: Severity,
    /// Emit a warning for null values in required source columns.
    #[serde(default = "default_true")]
    pub warn_on_null_inputs: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_row_count: None,
            max_row_count: None,
            row_count_severity: Severity::Blocking,
            warn_on_null_inputs: true,
        }
    }
}

/// One pipeline: what to read, what to compute, where to materialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub source_systems: BTreeMap<String, SourceSystem>,
    #[serde(default)]
    pub defaults: PipelineDefaults,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    pub materialized_table: String,
    /// Namespace of the materialized table, if any.
    #[serde(default)]
    pub target_namespace: Option<String>,
    /// Entity the materialized table is keyed by.
    pub entity: String,
    pub source_tables: Vec<SourceTable>,
    pub features: Vec<FeatureDefinition>,
    #[serde(default)]
    pub partition_column: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub write_mode: MaterializeMode,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl PipelineSpec {
    #[must_use]
    pub fn find_entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// The entity the materialized table is keyed by.
    #[must_use]
    pub fn target_entity(&self) -> Option<&Entity> {
        self.find_entity(&self.entity)
    }

    #[must_use]
    pub fn effective_partition_column(&self) -> &str {
        self.partition_column
            .as_deref()
            .unwrap_or(&self.defaults.partition_column)
    }

    #[must_use]
    pub fn effective_output_format(&self) -> &str {
        self.output_format
            .as_deref()
            .unwrap_or(&self.defaults.output_format)
    }

    #[must_use]
    pub fn target_table(&self) -> TableRef {
        TableRef {
            namespace: self.target_namespace.clone(),
            name: self.materialized_table.clone(),
        }
    }

    /// Warehouse table backing a logical source.
    #[must_use]
    pub fn source_table_ref(&self, source: &SourceTable) -> TableRef {
        match self.source_systems.get(&source.source) {
            Some(system) => TableRef::qualified(&system.connection, &system.table),
            None => TableRef::new(&source.source),
        }
    }

    /// Sources joined into the target entity's rows.
    pub fn entity_sources(&self) -> impl Iterator<Item = &SourceTable> {
        self.source_tables
            .iter()
            .filter(|s| s.entity.as_deref().map_or(true, |e| e == self.entity))
    }

    /// Every column a feature can read: key and required columns of the
    /// sources feeding the target entity. Sources keyed by another entity
    /// never join onto the target rows, so their columns are excluded.
    #[must_use]
    pub fn source_columns(&self) -> BTreeSet<&str> {
        self.entity_sources()
            .flat_map(|s| {
                std::iter::once(s.key_column.as_str())
                    .chain(s.required_columns.iter().map(String::as_str))
            })
            .collect()
    }

    #[must_use]
    pub fn find_feature(&self, name: &str) -> Option<&FeatureDefinition> {
        self.features.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUSTOMER_YAML: &str = r#"
version: "1.0"
pipeline: customer_features
entities:
  - name: customer
    key_column: customer_id
source_systems:
  customer_data:
    system_name: CRM
    connection: hive_crm
    table: customers_raw
materialized_table: customer_feature_table
entity: customer
source_tables:
  - source: customer_data
    key_column: customer_id
    required_columns: [purchase_amount, transaction_count]
  - source: transaction_data
    key_column: customer_id
    required_columns: [last_purchase_date]
features:
  - name: average_purchase_value
    type: FLOAT
    transformation:
      kind: ratio
      numerator: purchase_amount
      denominator: transaction_count
  - name: days_since_last_purchase
    type: INT
    transformation:
      kind: date_diff
      column: last_purchase_date
"#;

    #[test]
    fn test_deserialize_customer_pipeline() {
        let spec: PipelineSpec = serde_yaml::from_str(CUSTOMER_YAML).unwrap();
        assert_eq!(spec.pipeline, "customer_features");
        assert_eq!(spec.features.len(), 2);
        assert_eq!(spec.features[0].feature_type, FeatureType::Numeric);
        assert_eq!(spec.features[1].feature_type, FeatureType::Integer);
        assert_eq!(spec.write_mode, MaterializeMode::Overwrite);
        // Defaults applied
        assert_eq!(spec.effective_partition_column(), "event_time");
        assert_eq!(spec.effective_output_format(), "parquet");
        assert_eq!(spec.warehouse.connect_attempts, 3);
        assert_eq!(spec.warehouse.retry_base_delay_ms, 1_000);
        assert!(spec.validation.warn_on_null_inputs);
    }

    #[test]
    fn test_source_table_ref_uses_source_system() {
        let spec: PipelineSpec = serde_yaml::from_str(CUSTOMER_YAML).unwrap();
        let crm = spec.source_table_ref(&spec.source_tables[0]);
        assert_eq!(crm.to_string(), "hive_crm.customers_raw");
        let unmapped = spec.source_table_ref(&spec.source_tables[1]);
        assert_eq!(unmapped.to_string(), "transaction_data");
    }

    #[test]
    fn test_source_columns_include_keys() {
        let spec: PipelineSpec = serde_yaml::from_str(CUSTOMER_YAML).unwrap();
        let cols = spec.source_columns();
        assert!(cols.contains("customer_id"));
        assert!(cols.contains("last_purchase_date"));
        assert!(!cols.contains("average_purchase_value"));
    }

    #[test]
    fn test_source_columns_skip_other_entities() {
        let yaml = CUSTOMER_YAML
            .replace(
                "    key_column: customer_id\nsource_systems:",
                "    key_column: customer_id\n  - name: store\n    key_column: store_id\nsource_systems:",
            )
            .replace(
                "  - source: transaction_data\n    key_column: customer_id",
                "  - source: transaction_data\n    entity: store\n    key_column: store_id",
            );
        let spec: PipelineSpec = serde_yaml::from_str(&yaml).unwrap();
        let cols = spec.source_columns();
        assert!(cols.contains("purchase_amount"));
        assert!(!cols.contains("last_purchase_date"));
        assert!(!cols.contains("store_id"));
        assert_eq!(spec.entity_sources().count(), 1);
    }

    #[test]
    fn test_arithmetic_operands_parse_literals_and_columns() {
        let yaml = r"
kind: arithmetic
op: multiply
left: sale_amount
right: 1.2
";
        let t: Transformation = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            t,
            Transformation::Arithmetic {
                op: ArithmeticOp::Multiply,
                left: Operand::Column("sale_amount".into()),
                right: Operand::Literal(1.2),
            }
        );
        assert_eq!(t.references(), vec!["sale_amount"]);
    }

    #[test]
    fn test_grouped_ratio_references() {
        let t = Transformation::GroupedAggregateRatio {
            function: AggregateFunction::Count,
            column: "sale_id".into(),
            date_column: "sale_date".into(),
            group_by: Some("store_id".into()),
        };
        assert_eq!(t.references(), vec!["sale_id", "sale_date", "store_id"]);
        assert_eq!(t.kind_name(), "grouped_aggregate_ratio");
    }

    #[test]
    fn test_ratio_references_are_deduplicated() {
        let t = Transformation::Ratio {
            numerator: "x".into(),
            denominator: "x".into(),
        };
        assert_eq!(t.references(), vec!["x"]);
    }

    #[test]
    fn test_unknown_transformation_kind_fails() {
        let yaml = "kind: regression\ncolumn: x\n";
        assert!(serde_yaml::from_str::<Transformation>(yaml).is_err());
    }
}
