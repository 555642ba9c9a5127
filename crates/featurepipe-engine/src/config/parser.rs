//! Pipeline and feature YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::{FeatureDefinition, PipelineSpec};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineSpec> {
    let substituted = substitute_env_vars(yaml_str)?;
    let spec: PipelineSpec =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(spec)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content).with_context(|| format!("In {}", path.display()))
}

/// Parse a single feature definition (used by `insert-feature`).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_feature_str(yaml_str: &str) -> Result<FeatureDefinition> {
    let substituted = substitute_env_vars(yaml_str)?;
    serde_yaml::from_str(&substituted).context("Failed to parse feature YAML")
}

/// Parse a feature definition file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_feature(path: &Path) -> Result<FeatureDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feature file: {}", path.display()))?;
    parse_feature_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{FeatureType, Transformation, WarehouseBackend};

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("FP_TEST_DB_PATH", "/tmp/warehouse.db");
        let input = "path: ${FP_TEST_DB_PATH}\nmax_connections: 2";
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("/tmp/warehouse.db"));
        assert!(!result.contains("${FP_TEST_DB_PATH}"));
        std::env::remove_var("FP_TEST_DB_PATH");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "table: customers_raw\nconnection: hive_crm";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let input = "${FP_MISSING_X} and ${FP_MISSING_Y}";
        let err_msg = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err_msg.contains("FP_MISSING_X"));
        assert!(err_msg.contains("FP_MISSING_Y"));
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        std::env::set_var("FP_TEST_WAREHOUSE", "/var/lib/fp/wh.db");
        let yaml = r#"
version: "1.0"
pipeline: sales_features
entities:
  - name: sales
    key_column: sale_id
warehouse:
  backend: sqlite
  path: ${FP_TEST_WAREHOUSE}
materialized_table: sales_feature_table
entity: sales
source_tables:
  - source: sales_data
    key_column: sale_id
    required_columns: [sale_amount, sale_date]
features:
  - name: total_sales
    type: numeric
    transformation:
      kind: aggregate
      function: sum
      column: sale_amount
"#;
        let spec = parse_pipeline_str(yaml).unwrap();
        assert_eq!(spec.pipeline, "sales_features");
        assert_eq!(spec.warehouse.backend, WarehouseBackend::Sqlite);
        assert_eq!(spec.warehouse.path.as_deref(), Some("/var/lib/fp/wh.db"));
        std::env::remove_var("FP_TEST_WAREHOUSE");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let err_msg = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err_msg.contains("Failed to read pipeline file"));
    }

    #[test]
    fn test_parse_feature_definition() {
        let yaml = r"
name: purchase_per_day
type: numeric
depends_on: [average_purchase_value]
transformation:
  kind: arithmetic
  op: divide
  left: average_purchase_value
  right: 30
";
        let feature = parse_feature_str(yaml).unwrap();
        assert_eq!(feature.name, "purchase_per_day");
        assert_eq!(feature.feature_type, FeatureType::Numeric);
        assert!(matches!(
            feature.transformation,
            Transformation::Arithmetic { .. }
        ));
    }
}
