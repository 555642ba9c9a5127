//! Transformation executor: evaluates plan steps in order over the joined
//! source frame.
//!
//! Sources are joined on the entity key into one working row per key. Each
//! step reads source columns and earlier feature outputs from that frame and
//! writes its own column back, so later steps can depend on it. A step that
//! fails produces no output at all.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use featurepipe_types::{Row, RowSet, Value};

use crate::config::{
    AggregateFunction, ArithmeticOp, FeatureDefinition, FeatureType, Operand, Transformation,
};
use crate::error::ExecutorError;
use crate::resolve::ExecutionPlan;

/// One computed feature column, keyed by entity key.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureOutput {
    pub name: String,
    pub feature_type: FeatureType,
    pub values: BTreeMap<Value, Value>,
}

/// Everything a run computed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub key_column: String,
    /// Every entity key seen in the sources, ascending.
    pub keys: Vec<Value>,
    /// Feature columns in plan order.
    pub features: Vec<FeatureOutput>,
}

impl ExecutionOutput {
    #[must_use]
    pub fn feature(&self, name: &str) -> Option<&FeatureOutput> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Value of `feature` for `key`.
    #[must_use]
    pub fn value(&self, feature: &str, key: &Value) -> Option<&Value> {
        self.feature(feature)?.values.get(key)
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.keys.len()
    }

    /// Tabular form: the key column followed by the selected feature columns
    /// (all of them when `only` is `None`), one row per key in key order.
    #[must_use]
    pub fn to_row_set(&self, only: Option<&[String]>) -> RowSet {
        let selected: Vec<&FeatureOutput> = self
            .features
            .iter()
            .filter(|f| only.map_or(true, |names| names.contains(&f.name)))
            .collect();

        let mut columns = vec![self.key_column.clone()];
        columns.extend(selected.iter().map(|f| f.name.clone()));

        let rows = self
            .keys
            .iter()
            .map(|key| {
                let mut row = Row::new();
                row.insert(self.key_column.clone(), key.clone());
                for feature in &selected {
                    let value = feature.values.get(key).cloned().unwrap_or(Value::Null);
                    row.insert(feature.name.clone(), value);
                }
                row
            })
            .collect();

        RowSet { columns, rows }
    }
}

type Frame = BTreeMap<Value, Row>;

/// Execute `plan` against the loaded `sources`.
///
/// `as_of` is the reference date for date differences.
///
/// # Errors
///
/// Returns [`ExecutorError::MissingInput`] when a key's joined row lacks a
/// field a step reads, [`ExecutorError::TypeMismatch`] when a field has the
/// wrong type, and [`ExecutorError::Coercion`] when a result cannot be
/// represented as the declared feature type.
pub fn execute(
    plan: &ExecutionPlan,
    sources: &BTreeMap<String, RowSet>,
    as_of: NaiveDate,
) -> Result<ExecutionOutput, ExecutorError> {
    let key_column = plan.key_column();
    let mut frame = join_sources(key_column, sources);
    let mut features = Vec::with_capacity(plan.len());

    for step in &plan.steps {
        let feature = &step.feature;
        let raw = evaluate(feature, &frame, as_of)?;
        let mut values = BTreeMap::new();
        for (key, value) in raw {
            let coerced = coerce(feature, &key, value)?;
            values.insert(key, coerced);
        }

        for (key, value) in &values {
            if let Some(row) = frame.get_mut(key) {
                row.insert(feature.name.clone(), value.clone());
            }
        }

        tracing::debug!(
            feature = feature.name,
            kind = feature.transformation.kind_name(),
            rows = values.len(),
            "Feature computed"
        );

        features.push(FeatureOutput {
            name: feature.name.clone(),
            feature_type: feature.feature_type,
            values,
        });
    }

    Ok(ExecutionOutput {
        key_column: key_column.to_string(),
        keys: frame.into_keys().collect(),
        features,
    })
}

/// Outer-join sources on the key column. Rows with a null or absent key are
/// skipped. When two sources carry the same column for a key, the source
/// whose name sorts first wins.
fn join_sources(key_column: &str, sources: &BTreeMap<String, RowSet>) -> Frame {
    let mut frame = Frame::new();
    for rows in sources.values() {
        for row in &rows.rows {
            let Some(key) = row.get(key_column).filter(|k| !k.is_null()) else {
                continue;
            };
            let joined = frame.entry(key.clone()).or_default();
            for (column, value) in row {
                joined
                    .entry(column.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
    frame
}

fn evaluate(
    feature: &FeatureDefinition,
    frame: &Frame,
    as_of: NaiveDate,
) -> Result<BTreeMap<Value, Value>, ExecutorError> {
    let ctx = StepContext { feature };
    match &feature.transformation {
        Transformation::Ratio {
            numerator,
            denominator,
        } => per_row(frame, |key, row| {
            let n = ctx.number(key, row, numerator)?;
            let d = ctx.number(key, row, denominator)?;
            Ok(divide(n, d))
        }),
        Transformation::Arithmetic { op, left, right } => per_row(frame, |key, row| {
            let l = ctx.operand(key, row, left)?;
            let r = ctx.operand(key, row, right)?;
            Ok(match (op, l, r) {
                (ArithmeticOp::Divide, l, r) => divide(l, r),
                (ArithmeticOp::Add, Some(l), Some(r)) => Value::Float(l + r),
                (ArithmeticOp::Subtract, Some(l), Some(r)) => Value::Float(l - r),
                (ArithmeticOp::Multiply, Some(l), Some(r)) => Value::Float(l * r),
                _ => Value::Null,
            })
        }),
        Transformation::DateDiff { column } => per_row(frame, |key, row| {
            Ok(match ctx.date(key, row, column)? {
                Some(date) => Value::Int((as_of - date).num_days()),
                None => Value::Null,
            })
        }),
        Transformation::Aggregate {
            function,
            column,
            group_by,
        } => {
            let groups = ctx.groups(frame, group_by.as_deref())?;
            let mut out = BTreeMap::new();
            for members in groups.values() {
                let value = ctx.aggregate(*function, column, members)?;
                for (key, _) in members {
                    out.insert((*key).clone(), value.clone());
                }
            }
            Ok(out)
        }
        Transformation::GroupedAggregateRatio {
            function,
            column,
            date_column,
            group_by,
        } => {
            let groups = ctx.groups(frame, group_by.as_deref())?;
            let mut out = BTreeMap::new();
            for members in groups.values() {
                let aggregate = ctx.aggregate(*function, column, members)?;
                let numerator = match (&aggregate, members.first()) {
                    (Value::Null, _) | (_, None) => None,
                    (value, Some((key, _))) => Some(value.as_f64().ok_or_else(|| {
                        ctx.mismatch(key, column, "numeric", value)
                    })?),
                };
                let span = ctx.day_span(date_column, members)?;
                #[allow(clippy::cast_precision_loss)]
                let value = divide(numerator, span.map(|days| days as f64));
                for (key, _) in members {
                    out.insert((*key).clone(), value.clone());
                }
            }
            Ok(out)
        }
    }
}

/// Apply a row-wise transformation to every key of the frame.
fn per_row<F>(frame: &Frame, mut f: F) -> Result<BTreeMap<Value, Value>, ExecutorError>
where
    F: FnMut(&Value, &Row) -> Result<Value, ExecutorError>,
{
    let mut out = BTreeMap::new();
    for (key, row) in frame {
        out.insert(key.clone(), f(key, row)?);
    }
    Ok(out)
}

/// `n / d`; null when either side is null or `d` is zero.
fn divide(n: Option<f64>, d: Option<f64>) -> Value {
    match (n, d) {
        (Some(n), Some(d)) if d != 0.0 => Value::Float(n / d),
        _ => Value::Null,
    }
}

type Members<'a> = Vec<(&'a Value, &'a Row)>;

struct StepContext<'a> {
    feature: &'a FeatureDefinition,
}

impl StepContext<'_> {
    fn field<'r>(&self, key: &Value, row: &'r Row, field: &str) -> Result<&'r Value, ExecutorError> {
        row.get(field).ok_or_else(|| ExecutorError::MissingInput {
            feature: self.feature.name.clone(),
            key: key.to_string(),
            field: field.to_string(),
        })
    }

    fn mismatch(&self, key: &Value, field: &str, expected: &'static str, found: &Value) -> ExecutorError {
        ExecutorError::TypeMismatch {
            feature: self.feature.name.clone(),
            key: key.to_string(),
            field: field.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    fn number(&self, key: &Value, row: &Row, field: &str) -> Result<Option<f64>, ExecutorError> {
        let value = self.field(key, row, field)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_f64()
            .map(Some)
            .ok_or_else(|| self.mismatch(key, field, "numeric", value))
    }

    fn operand(&self, key: &Value, row: &Row, operand: &Operand) -> Result<Option<f64>, ExecutorError> {
        match operand {
            Operand::Literal(v) => Ok(Some(*v)),
            Operand::Column(name) => self.number(key, row, name),
        }
    }

    fn date(&self, key: &Value, row: &Row, field: &str) -> Result<Option<NaiveDate>, ExecutorError> {
        let value = self.field(key, row, field)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_date()
            .map(Some)
            .ok_or_else(|| self.mismatch(key, field, "date", value))
    }

    /// Partition frame rows by `group_by`, or one group for the whole frame.
    fn groups<'f>(
        &self,
        frame: &'f Frame,
        group_by: Option<&str>,
    ) -> Result<BTreeMap<Value, Members<'f>>, ExecutorError> {
        let mut groups: BTreeMap<Value, Members<'f>> = BTreeMap::new();
        for (key, row) in frame {
            let group = match group_by {
                Some(column) => self.field(key, row, column)?.clone(),
                None => Value::Null,
            };
            groups.entry(group).or_default().push((key, row));
        }
        Ok(groups)
    }

    fn aggregate(
        &self,
        function: AggregateFunction,
        column: &str,
        members: &Members<'_>,
    ) -> Result<Value, ExecutorError> {
        let mut present: Vec<(&Value, &Value)> = Vec::with_capacity(members.len());
        for (key, row) in members {
            let value = self.field(key, row, column)?;
            if !value.is_null() {
                present.push((*key, value));
            }
        }

        match function {
            #[allow(clippy::cast_possible_wrap)]
            AggregateFunction::Count => Ok(Value::Int(present.len() as i64)),
            AggregateFunction::Min => Ok(present
                .iter()
                .map(|(_, v)| *v)
                .min()
                .cloned()
                .unwrap_or(Value::Null)),
            AggregateFunction::Max => Ok(present
                .iter()
                .map(|(_, v)| *v)
                .max()
                .cloned()
                .unwrap_or(Value::Null)),
            AggregateFunction::Sum | AggregateFunction::Mean => {
                if present.is_empty() {
                    return Ok(Value::Null);
                }
                let mut int_sum: Option<i64> = Some(0);
                let mut float_sum = 0.0;
                for (key, value) in &present {
                    let number = value
                        .as_f64()
                        .ok_or_else(|| self.mismatch(key, column, "numeric", value))?;
                    float_sum += number;
                    int_sum = match (int_sum, value) {
                        (Some(acc), Value::Int(i)) => acc.checked_add(*i),
                        _ => None,
                    };
                }
                #[allow(clippy::cast_precision_loss)]
                let count = present.len() as f64;
                Ok(match (function, int_sum) {
                    (AggregateFunction::Sum, Some(total)) => Value::Int(total),
                    (AggregateFunction::Sum, None) => Value::Float(float_sum),
                    _ => Value::Float(float_sum / count),
                })
            }
        }
    }

    /// `max(date) - min(date)` in days over the group's non-null dates.
    fn day_span(&self, column: &str, members: &Members<'_>) -> Result<Option<i64>, ExecutorError> {
        let mut bounds: Option<(NaiveDate, NaiveDate)> = None;
        for (key, row) in members {
            if let Some(date) = self.date(key, row, column)? {
                bounds = Some(match bounds {
                    Some((lo, hi)) => (lo.min(date), hi.max(date)),
                    None => (date, date),
                });
            }
        }
        Ok(bounds.map(|(lo, hi)| (hi - lo).num_days()))
    }
}

/// Convert a computed value to the feature's declared type.
fn coerce(feature: &FeatureDefinition, key: &Value, value: Value) -> Result<Value, ExecutorError> {
    let fail = |value: &Value| ExecutorError::Coercion {
        feature: feature.name.clone(),
        key: key.to_string(),
        value: value.to_string(),
        target: feature.feature_type,
    };

    let coerced = match (feature.feature_type, value) {
        (_, Value::Null) => Value::Null,
        (FeatureType::Numeric, Value::Int(i)) => {
            #[allow(clippy::cast_precision_loss)]
            let f = i as f64;
            Value::Float(f)
        }
        (FeatureType::Numeric, Value::Float(f)) => Value::Float(f),
        (FeatureType::Numeric, Value::Str(s)) => match s.trim().parse::<f64>() {
            Ok(f) => Value::Float(f),
            Err(_) => return Err(fail(&Value::Str(s))),
        },
        (FeatureType::Integer, Value::Int(i)) => Value::Int(i),
        (FeatureType::Integer, Value::Float(f)) => {
            if !f.is_finite() || f.trunc().abs() >= 9.2e18 {
                return Err(fail(&Value::Float(f)));
            }
            #[allow(clippy::cast_possible_truncation)]
            let i = f.trunc() as i64;
            Value::Int(i)
        }
        (FeatureType::Integer, Value::Str(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => return Err(fail(&Value::Str(s))),
        },
        (FeatureType::String, Value::Str(s)) => Value::Str(s),
        (FeatureType::String, other) => Value::Str(other.to_string()),
        (FeatureType::Date, Value::Date(d)) => Value::Date(d),
        (FeatureType::Date, other) => match other.as_date() {
            Some(d) => Value::Date(d),
            None => return Err(fail(&other)),
        },
        (_, other) => return Err(fail(&other)),
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Entity;
    use crate::resolve::PlanStep;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn feature(name: &str, feature_type: FeatureType, transformation: Transformation) -> FeatureDefinition {
        FeatureDefinition {
            name: name.into(),
            entity: None,
            feature_type,
            transformation,
            depends_on: vec![],
            description: None,
        }
    }

    fn plan(key: &str, features: Vec<FeatureDefinition>) -> ExecutionPlan {
        ExecutionPlan {
            entity: Entity {
                name: "e".into(),
                key_column: key.into(),
            },
            steps: features
                .into_iter()
                .map(|feature| PlanStep {
                    feature,
                    depends_on: vec![],
                })
                .collect(),
        }
    }

    fn sources(entries: Vec<(&str, RowSet)>) -> BTreeMap<String, RowSet> {
        entries.into_iter().map(|(n, r)| (n.to_string(), r)).collect()
    }

    fn ratio(name: &str, n: &str, d: &str) -> FeatureDefinition {
        feature(
            name,
            FeatureType::Numeric,
            Transformation::Ratio {
                numerator: n.into(),
                denominator: d.into(),
            },
        )
    }

    #[test]
    fn test_average_purchase_value_is_ratio() {
        let src = sources(vec![(
            "customer_data",
            RowSet::from_values(
                &["customer_id", "purchase_amount", "transaction_count"],
                vec![vec![Value::Int(7), Value::Int(100), Value::Int(4)]],
            ),
        )]);
        let out = execute(
            &plan("customer_id", vec![ratio("average_purchase_value", "purchase_amount", "transaction_count")]),
            &src,
            date("2024-01-01"),
        )
        .unwrap();
        assert_eq!(
            out.value("average_purchase_value", &Value::Int(7)),
            Some(&Value::Float(25.0))
        );
    }

    #[test]
    fn test_zero_denominator_and_null_inputs_yield_null() {
        let src = sources(vec![(
            "s",
            RowSet::from_values(
                &["id", "a", "b"],
                vec![
                    vec![Value::Int(1), Value::Int(5), Value::Int(0)],
                    vec![Value::Int(2), Value::Null, Value::Int(2)],
                ],
            ),
        )]);
        let out = execute(&plan("id", vec![ratio("r", "a", "b")]), &src, date("2024-01-01")).unwrap();
        assert_eq!(out.value("r", &Value::Int(1)), Some(&Value::Null));
        assert_eq!(out.value("r", &Value::Int(2)), Some(&Value::Null));
    }

    #[test]
    fn test_absent_input_fails_with_key_and_field() {
        // Key 2 only appears in the second source, so it lacks `a`.
        let src = sources(vec![
            ("s1", RowSet::from_values(&["id", "a"], vec![vec![Value::Int(1), Value::Int(3)]])),
            ("s2", RowSet::from_values(&["id", "b"], vec![
                vec![Value::Int(1), Value::Int(1)],
                vec![Value::Int(2), Value::Int(1)],
            ])),
        ]);
        let err = execute(&plan("id", vec![ratio("r", "a", "b")]), &src, date("2024-01-01")).unwrap_err();
        match err {
            ExecutorError::MissingInput { feature, key, field } => {
                assert_eq!(feature, "r");
                assert_eq!(key, "2");
                assert_eq!(field, "a");
            }
            other => panic!("expected missing input, got {other}"),
        }
    }

    #[test]
    fn test_date_diff_uses_as_of_and_truncates_to_integer() {
        let src = sources(vec![(
            "t",
            RowSet::from_values(
                &["customer_id", "last_purchase_date"],
                vec![
                    vec![Value::Int(1), Value::Date(date("2024-01-01"))],
                    vec![Value::Int(2), Value::Str("2024-01-31".into())],
                ],
            ),
        )]);
        let f = feature(
            "days_since_last_purchase",
            FeatureType::Integer,
            Transformation::DateDiff {
                column: "last_purchase_date".into(),
            },
        );
        let out = execute(&plan("customer_id", vec![f]), &src, date("2024-02-01")).unwrap();
        assert_eq!(out.value("days_since_last_purchase", &Value::Int(1)), Some(&Value::Int(31)));
        assert_eq!(out.value("days_since_last_purchase", &Value::Int(2)), Some(&Value::Int(1)));
    }

    #[test]
    fn test_later_steps_read_earlier_features() {
        let src = sources(vec![(
            "s",
            RowSet::from_values(&["id", "a", "b"], vec![vec![Value::Int(1), Value::Int(9), Value::Int(3)]]),
        )]);
        let doubled = feature(
            "doubled",
            FeatureType::Numeric,
            Transformation::Arithmetic {
                op: ArithmeticOp::Multiply,
                left: Operand::Column("r".into()),
                right: Operand::Literal(2.0),
            },
        );
        let out = execute(&plan("id", vec![ratio("r", "a", "b"), doubled]), &src, date("2024-01-01")).unwrap();
        assert_eq!(out.value("doubled", &Value::Int(1)), Some(&Value::Float(6.0)));
    }

    #[test]
    fn test_sales_aggregates_are_broadcast() {
        let src = sources(vec![(
            "sales_data",
            RowSet::from_values(
                &["sale_id", "sale_amount", "sale_date"],
                vec![
                    vec![Value::Int(1), Value::Float(10.0), Value::Date(date("2024-01-01"))],
                    vec![Value::Int(2), Value::Float(20.0), Value::Date(date("2024-01-05"))],
                    vec![Value::Int(3), Value::Float(30.0), Value::Date(date("2024-01-11"))],
                ],
            ),
        )]);
        let total = feature(
            "total_sales",
            FeatureType::Numeric,
            Transformation::Aggregate {
                function: AggregateFunction::Sum,
                column: "sale_amount".into(),
                group_by: None,
            },
        );
        let frequency = feature(
            "sales_frequency",
            FeatureType::Numeric,
            Transformation::GroupedAggregateRatio {
                function: AggregateFunction::Count,
                column: "sale_id".into(),
                date_column: "sale_date".into(),
                group_by: None,
            },
        );
        let out = execute(&plan("sale_id", vec![total, frequency]), &src, date("2024-02-01")).unwrap();
        for key in 1..=3 {
            assert_eq!(out.value("total_sales", &Value::Int(key)), Some(&Value::Float(60.0)));
            // 3 sales over a 10 day span
            assert_eq!(out.value("sales_frequency", &Value::Int(key)), Some(&Value::Float(0.3)));
        }
    }

    #[test]
    fn test_grouped_aggregate_respects_group_by_and_zero_span() {
        let src = sources(vec![(
            "sales",
            RowSet::from_values(
                &["sale_id", "store", "sale_date"],
                vec![
                    vec![Value::Int(1), Value::from("a"), Value::Date(date("2024-01-01"))],
                    vec![Value::Int(2), Value::from("a"), Value::Date(date("2024-01-03"))],
                    vec![Value::Int(3), Value::from("b"), Value::Date(date("2024-01-03"))],
                ],
            ),
        )]);
        let f = feature(
            "per_day",
            FeatureType::Numeric,
            Transformation::GroupedAggregateRatio {
                function: AggregateFunction::Count,
                column: "sale_id".into(),
                date_column: "sale_date".into(),
                group_by: Some("store".into()),
            },
        );
        let out = execute(&plan("sale_id", vec![f]), &src, date("2024-02-01")).unwrap();
        assert_eq!(out.value("per_day", &Value::Int(1)), Some(&Value::Float(1.0)));
        assert_eq!(out.value("per_day", &Value::Int(2)), Some(&Value::Float(1.0)));
        assert_eq!(out.value("per_day", &Value::Int(3)), Some(&Value::Null));
    }

    #[test]
    fn test_non_numeric_input_is_type_mismatch() {
        let src = sources(vec![(
            "s",
            RowSet::from_values(&["id", "a", "b"], vec![vec![Value::Int(1), Value::from("x"), Value::Int(1)]]),
        )]);
        let err = execute(&plan("id", vec![ratio("r", "a", "b")]), &src, date("2024-01-01")).unwrap_err();
        assert!(matches!(err, ExecutorError::TypeMismatch { expected: "numeric", found: "string", .. }));
    }

    #[test]
    fn test_uncoercible_result_fails_step() {
        let src = sources(vec![(
            "s",
            RowSet::from_values(&["id", "a", "b"], vec![vec![Value::Int(1), Value::Int(1), Value::Int(2)]]),
        )]);
        let mut f = ratio("r", "a", "b");
        f.feature_type = FeatureType::Date;
        let err = execute(&plan("id", vec![f]), &src, date("2024-01-01")).unwrap_err();
        assert!(matches!(err, ExecutorError::Coercion { target: FeatureType::Date, .. }));
    }

    #[test]
    fn test_to_row_set_selects_columns_in_key_order() {
        let src = sources(vec![(
            "s",
            RowSet::from_values(
                &["id", "a", "b"],
                vec![
                    vec![Value::Int(2), Value::Int(4), Value::Int(2)],
                    vec![Value::Int(1), Value::Int(1), Value::Int(1)],
                ],
            ),
        )]);
        let out = execute(
            &plan("id", vec![ratio("r", "a", "b"), ratio("q", "b", "a")]),
            &src,
            date("2024-01-01"),
        )
        .unwrap();
        let only = vec!["q".to_string()];
        let rs = out.to_row_set(Some(&only));
        assert_eq!(rs.columns, vec!["id".to_string(), "q".to_string()]);
        assert_eq!(rs.rows[0]["id"], Value::Int(1));
        assert_eq!(rs.rows[1]["q"], Value::Float(0.5));
        assert_eq!(out.to_row_set(None).columns.len(), 3);
    }
}
