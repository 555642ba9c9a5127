//! Scalar cell values and rows.
//!
//! [`Value`] is totally ordered so it can key a `BTreeMap`. Numbers compare
//! by exact mathematical value across `Int` and `Float`, with `0.0 == -0.0`.
//! NaN sorts above every number, or below when its sign bit is set.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Date format used when dates travel as text.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
}

/// One row: column name to value. A column absent from the map is distinct
/// from a column present with [`Value::Null`].
pub type Row = BTreeMap<String, Value>;

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value. Text is not parsed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Date view of the value; `YYYY-MM-DD` text is accepted.
    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Str(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok(),
            _ => None,
        }
    }

    /// Short type label used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "integer",
            Self::Float(_) => "numeric",
            Self::Str(_) => "string",
            Self::Date(_) => "date",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) | Self::Float(_) => 1,
            Self::Str(_) => 2,
            Self::Date(_) => 3,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Self::Int(a), Self::Float(b)) => cmp_int_float(*a, *b),
            (Self::Float(a), Self::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Exact comparison of an integer against a float. `i as f64` rounds to
/// the nearest float, so a strict result there is already exact; on a tie
/// `f` is whole and within `i128`, so compare as integers.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    match (i as f64).partial_cmp(&f) {
        Some(Ordering::Equal) | None => i128::from(i).cmp(&(f as i128)),
        Some(ordering) => ordering,
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ints_and_floats_compare_numerically() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert!(Value::Int(1) < Value::Float(1.5));
        assert!(Value::Float(-0.5) < Value::Int(0));
    }

    #[test]
    fn test_mixed_numeric_order_is_transitive() {
        let a = Value::Int(1 << 53);
        let b = Value::Float(9_007_199_254_740_992.0);
        let c = Value::Int((1 << 53) + 1);
        assert_eq!(a, b);
        assert!(b < c);
        assert!(a < c);
        assert!(Value::Float(9.3e18) > Value::Int(i64::MAX));
        assert!(Value::Float(-9.3e18) < Value::Int(i64::MIN));
    }

    #[test]
    fn test_signed_zero_and_nan_order() {
        assert_eq!(Value::Float(-0.0), Value::Float(0.0));
        assert_eq!(Value::Int(0), Value::Float(-0.0));
        assert!(Value::Float(f64::NAN) > Value::Int(i64::MAX));
        assert!(Value::Float(-f64::NAN) < Value::Int(i64::MIN));
        assert!(Value::Float(f64::NAN) > Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_null_sorts_first() {
        let mut values = vec![Value::from("b"), Value::Int(3), Value::Null];
        values.sort();
        assert_eq!(values, vec![Value::Null, Value::Int(3), Value::from("b")]);
    }

    #[test]
    fn test_date_parses_from_text() {
        let v = Value::from("2024-03-01");
        assert_eq!(v.as_date(), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert!(Value::from("not a date").as_date().is_none());
    }

    #[test]
    fn test_display_formats_dates() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        assert_eq!(Value::Date(d).to_string(), "2024-01-09");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_option_conversion_maps_none_to_null() {
        let v: Value = Option::<i64>::None.into();
        assert!(v.is_null());
        let v: Value = Some(4_i64).into();
        assert_eq!(v, Value::Int(4));
    }

    #[test]
    fn test_serde_is_tagged() {
        let json = serde_json::to_string(&Value::Int(7)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":7}"#);
    }
}
