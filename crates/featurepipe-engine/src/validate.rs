//! Pre- and post-execution data-quality checks.
//!
//! Rules never fail the call itself; every problem becomes a [`Finding`]
//! and the orchestrator decides what a blocking finding means.

use std::collections::BTreeMap;

use featurepipe_types::{Finding, RowSet, Severity, Value};

use crate::config::{SourceTable, ValidationConfig};

/// A single data-quality rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Every listed column is present in the relation.
    RequiredColumns(Vec<String>),
    /// The key column is present and non-null on every row.
    KeyNotNull(String),
    /// No two rows share a key value.
    UniqueKey(String),
    /// Warn about null values in the listed columns.
    NullInputs(Vec<String>),
    /// Row count within `[min, max]`.
    RowCount {
        min: Option<u64>,
        max: Option<u64>,
        severity: Severity,
    },
}

impl Rule {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequiredColumns(_) => "required_columns",
            Self::KeyNotNull(_) => "key_not_null",
            Self::UniqueKey(_) => "unique_key",
            Self::NullInputs(_) => "null_inputs",
            Self::RowCount { .. } => "row_count",
        }
    }
}

/// Run `rules` against `rows`, returning every finding.
#[must_use]
pub fn check(subject: &str, rows: &RowSet, rules: &[Rule]) -> Vec<Finding> {
    let mut findings = Vec::new();
    for rule in rules {
        match rule {
            Rule::RequiredColumns(columns) => {
                for column in columns {
                    if !rows.has_column(column) {
                        findings.push(Finding::blocking(
                            rule.name(),
                            subject,
                            format!("required column '{column}' is missing"),
                        ));
                    }
                }
            }
            Rule::KeyNotNull(key) => {
                if !rows.has_column(key) {
                    findings.push(Finding::blocking(
                        rule.name(),
                        subject,
                        format!("key column '{key}' is missing"),
                    ));
                    continue;
                }
                let nulls = count_nulls(rows, key);
                if nulls > 0 {
                    findings.push(Finding::blocking(
                        rule.name(),
                        subject,
                        format!("{nulls} row(s) with null '{key}'"),
                    ));
                }
            }
            Rule::UniqueKey(key) => {
                let mut seen: BTreeMap<&Value, usize> = BTreeMap::new();
                for value in rows.column_values(key).flatten() {
                    if !value.is_null() {
                        *seen.entry(value).or_default() += 1;
                    }
                }
                let duplicated: Vec<String> = seen
                    .into_iter()
                    .filter(|(_, n)| *n > 1)
                    .map(|(v, _)| v.to_string())
                    .collect();
                if !duplicated.is_empty() {
                    findings.push(Finding::blocking(
                        rule.name(),
                        subject,
                        format!(
                            "{} duplicated '{key}' value(s): {}",
                            duplicated.len(),
                            preview(&duplicated)
                        ),
                    ));
                }
            }
            Rule::NullInputs(columns) => {
                for column in columns.iter().filter(|c| rows.has_column(c)) {
                    let nulls = count_nulls(rows, column);
                    if nulls > 0 {
                        findings.push(Finding::warning(
                            rule.name(),
                            subject,
                            format!("{nulls} null value(s) in '{column}'"),
                        ));
                    }
                }
            }
            Rule::RowCount { min, max, severity } => {
                let count = rows.len() as u64;
                let message = match (min, max) {
                    (Some(min), _) if count < *min => {
                        Some(format!("row count {count} is below minimum {min}"))
                    }
                    (_, Some(max)) if count > *max => {
                        Some(format!("row count {count} exceeds maximum {max}"))
                    }
                    _ => None,
                };
                if let Some(message) = message {
                    findings.push(Finding {
                        severity: *severity,
                        rule: rule.name().to_string(),
                        subject: subject.to_string(),
                        message,
                    });
                }
            }
        }
    }
    findings
}

/// Rules applied to a loaded source before execution.
#[must_use]
pub fn source_rules(source: &SourceTable, config: &ValidationConfig) -> Vec<Rule> {
    let mut rules = vec![
        Rule::RequiredColumns(source.required_columns.clone()),
        Rule::KeyNotNull(source.key_column.clone()),
        Rule::UniqueKey(source.key_column.clone()),
    ];
    if config.warn_on_null_inputs {
        rules.push(Rule::NullInputs(source.required_columns.clone()));
    }
    rules
}

/// Rules applied to the computed output before materialization.
#[must_use]
pub fn output_rules(key_column: &str, config: &ValidationConfig) -> Vec<Rule> {
    let mut rules = vec![
        Rule::KeyNotNull(key_column.to_string()),
        Rule::UniqueKey(key_column.to_string()),
    ];
    if config.min_row_count.is_some() || config.max_row_count.is_some() {
        rules.push(Rule::RowCount {
            min: config.min_row_count,
            max: config.max_row_count,
            severity: config.row_count_severity,
        });
    }
    rules
}

#[must_use]
pub fn has_blocking(findings: &[Finding]) -> bool {
    findings.iter().any(Finding::is_blocking)
}

fn count_nulls(rows: &RowSet, column: &str) -> usize {
    rows.column_values(column)
        .filter(|v| v.map_or(true, Value::is_null))
        .count()
}

fn preview(values: &[String]) -> String {
    const SHOWN: usize = 5;
    if values.len() <= SHOWN {
        values.join(", ")
    } else {
        format!("{}, ...", values[..SHOWN].join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> RowSet {
        RowSet::from_values(
            &["customer_id", "purchase_amount"],
            vec![
                vec![Value::Int(1), Value::Float(100.0)],
                vec![Value::Null, Value::Float(50.0)],
                vec![Value::Int(3), Value::Null],
            ],
        )
    }

    #[test]
    fn test_null_key_is_blocking() {
        let findings = check("customer_data", &customers(), &[Rule::KeyNotNull("customer_id".into())]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_blocking());
        assert!(findings[0].message.contains("1 row(s)"));
    }

    #[test]
    fn test_missing_required_column_is_blocking() {
        let findings = check(
            "customer_data",
            &customers(),
            &[Rule::RequiredColumns(vec![
                "purchase_amount".into(),
                "transaction_count".into(),
            ])],
        );
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("transaction_count"));
        assert!(has_blocking(&findings));
    }

    #[test]
    fn test_null_inputs_only_warn() {
        let findings = check(
            "customer_data",
            &customers(),
            &[Rule::NullInputs(vec!["purchase_amount".into()])],
        );
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert!(!has_blocking(&findings));
    }

    #[test]
    fn test_duplicate_keys_are_reported() {
        let rows = RowSet::from_values(
            &["id"],
            vec![vec![Value::Int(1)], vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        let findings = check("out", &rows, &[Rule::UniqueKey("id".into())]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("1 duplicated"));
    }

    #[test]
    fn test_row_count_uses_configured_severity() {
        let rows = RowSet::from_values(&["id"], vec![vec![Value::Int(1)]]);
        let rule = Rule::RowCount {
            min: Some(2),
            max: None,
            severity: Severity::Warning,
        };
        let findings = check("out", &rows, &[rule]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);

        let within = Rule::RowCount {
            min: Some(1),
            max: Some(1),
            severity: Severity::Blocking,
        };
        assert!(check("out", &rows, &[within]).is_empty());
    }

    #[test]
    fn test_output_rules_skip_row_count_when_unbounded() {
        let rules = output_rules("id", &ValidationConfig::default());
        assert!(!rules.iter().any(|r| matches!(r, Rule::RowCount { .. })));
    }
}
