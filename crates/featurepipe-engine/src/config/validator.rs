//! Semantic validation for parsed pipeline configuration values.

use std::collections::BTreeSet;

use crate::config::types::PipelineSpec;
use crate::error::ConfigError;

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] listing every problem found.
pub fn validate_pipeline(spec: &PipelineSpec) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if spec.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            spec.version
        ));
    }

    if spec.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if spec.materialized_table.trim().is_empty() {
        errors.push("materialized_table must not be empty".to_string());
    }

    let mut entity_names = BTreeSet::new();
    for entity in &spec.entities {
        if entity.name.trim().is_empty() || entity.key_column.trim().is_empty() {
            errors.push(format!(
                "Entity '{}' must have a name and a key_column",
                entity.name
            ));
        }
        if !entity_names.insert(entity.name.as_str()) {
            errors.push(format!("Entity '{}' is declared more than once", entity.name));
        }
    }

    if spec.target_entity().is_none() {
        errors.push(format!(
            "Pipeline entity '{}' is not declared in entities",
            spec.entity
        ));
    }

    if spec.source_tables.is_empty() {
        errors.push("Pipeline must define at least one source table".to_string());
    }

    for source in &spec.source_tables {
        validate_source(source, &mut errors);
        if let Some(entity) = &source.entity {
            if spec.find_entity(entity).is_none() {
                errors.push(format!(
                    "Source '{}' feeds undeclared entity '{entity}'",
                    source.source
                ));
            }
        }
    }

    if spec.features.is_empty() {
        errors.push("Pipeline must define at least one feature".to_string());
    }

    let source_columns = spec.source_columns();
    let mut feature_names = BTreeSet::new();
    for feature in &spec.features {
        if feature.name.trim().is_empty() {
            errors.push("Feature with an empty name".to_string());
            continue;
        }
        if !feature_names.insert(feature.name.as_str()) {
            errors.push(format!("Feature '{}' is declared more than once", feature.name));
        }
        if source_columns.contains(feature.name.as_str()) {
            errors.push(format!(
                "Feature '{}' has the same name as a source column",
                feature.name
            ));
        }
        if let Some(entity) = &feature.entity {
            if *entity != spec.entity {
                errors.push(format!(
                    "Feature '{}' belongs to entity '{entity}' but the pipeline is keyed by '{}'",
                    feature.name, spec.entity
                ));
            }
        }
    }

    let warehouse = &spec.warehouse;
    if warehouse.max_connections == 0 {
        errors.push("warehouse.max_connections must be at least 1".to_string());
    }
    if warehouse.connect_attempts == 0 {
        errors.push("warehouse.connect_attempts must be at least 1".to_string());
    }
    if warehouse.retry_base_delay_ms > warehouse.retry_max_delay_ms {
        errors.push(
            "warehouse.retry_base_delay_ms must not exceed retry_max_delay_ms".to_string(),
        );
    }

    if let (Some(min), Some(max)) = (
        spec.validation.min_row_count,
        spec.validation.max_row_count,
    ) {
        if min > max {
            errors.push(format!(
                "validation.min_row_count ({min}) exceeds max_row_count ({max})"
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid { problems: errors })
    }
}

fn validate_source(source: &crate::config::SourceTable, errors: &mut Vec<String>) {
    if source.source.trim().is_empty() {
        errors.push("Source table with an empty name".to_string());
    }
    if source.key_column.trim().is_empty() {
        errors.push(format!("Source '{}' has an empty key_column", source.source));
    }
    if source.required_columns.is_empty() {
        errors.push(format!(
            "Source '{}' must list at least one required column",
            source.source
        ));
    }
    let mut seen = BTreeSet::new();
    for column in &source.required_columns {
        if column.trim().is_empty() {
            errors.push(format!("Source '{}' has an empty required column", source.source));
        } else if !seen.insert(column.as_str()) {
            errors.push(format!(
                "Source '{}' lists required column '{column}' more than once",
                source.source
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: customer_features
entities:
  - name: customer
    key_column: customer_id
materialized_table: customer_feature_table
entity: customer
source_tables:
  - source: customer_data
    key_column: customer_id
    required_columns: [purchase_amount, transaction_count]
features:
  - name: average_purchase_value
    type: numeric
    transformation:
      kind: ratio
      numerator: purchase_amount
      denominator: transaction_count
"#
    }

    fn problems(yaml: &str) -> String {
        let spec = parse_pipeline_str(yaml).unwrap();
        validate_pipeline(&spec).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let spec = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&spec).is_ok());
    }

    #[test]
    fn test_wrong_version_fails() {
        let err = problems(&valid_yaml().replace("\"1.0\"", "\"2.0\""));
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn test_undeclared_entity_fails() {
        let err = problems(&valid_yaml().replace("entity: customer", "entity: account"));
        assert!(err.contains("'account' is not declared"));
    }

    #[test]
    fn test_duplicate_required_columns_fail() {
        let err = problems(
            &valid_yaml().replace("[purchase_amount, transaction_count]", "[purchase_amount, purchase_amount]"),
        );
        assert!(err.contains("more than once"));
    }

    #[test]
    fn test_empty_required_columns_fail() {
        let err = problems(&valid_yaml().replace("[purchase_amount, transaction_count]", "[]"));
        assert!(err.contains("at least one required column"));
    }

    #[test]
    fn test_feature_shadowing_source_column_fails() {
        let err = problems(&valid_yaml().replace("name: average_purchase_value", "name: purchase_amount"));
        assert!(err.contains("same name as a source column"));
    }

    #[test]
    fn test_row_count_bounds_must_be_ordered() {
        let yaml = format!(
            "{}validation:\n  min_row_count: 10\n  max_row_count: 5\n",
            valid_yaml()
        );
        assert!(problems(&yaml).contains("exceeds max_row_count"));
    }

    #[test]
    fn test_zero_connect_attempts_fails() {
        let yaml = format!("{}warehouse:\n  connect_attempts: 0\n", valid_yaml());
        assert!(problems(&yaml).contains("connect_attempts"));
    }

    #[test]
    fn test_all_problems_reported_together() {
        let yaml = valid_yaml()
            .replace("\"1.0\"", "\"0.9\"")
            .replace("pipeline: customer_features", "pipeline: \"\"");
        let err = problems(&yaml);
        assert!(err.starts_with("Pipeline validation failed:"));
        assert!(err.contains("Unsupported pipeline version"));
        assert!(err.contains("Pipeline name must not be empty"));
    }
}
