// 🏛️ Semantic Layer - Attribute Types & Values
// Every column has a semantic type; raw values are coerced once, at the edge.

use chrono::NaiveDate;
use rusqlite::types::{FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Date formats accepted from incoming records (first match wins)
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y"];

/// Storage format for dates
const DATE_STORAGE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// ATTRIBUTE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Text,
    Integer,
    Decimal,
    Date,
}

impl AttributeType {
    /// Declared SQLite column type
    pub fn sql_type(&self) -> &'static str {
        match self {
            AttributeType::Text => "TEXT",
            AttributeType::Integer => "INTEGER",
            AttributeType::Decimal => "REAL",
            AttributeType::Date => "TEXT",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeType::Text => "text",
            AttributeType::Integer => "integer",
            AttributeType::Decimal => "decimal",
            AttributeType::Date => "date",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TYPED VALUE
// ============================================================================

/// A value after coercion to its column's semantic type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Coerce a raw incoming value to `ty`.
    ///
    /// `null`, a missing value and a blank string all become `Value::Null`.
    /// On failure the offending raw text is returned so the caller can build
    /// a `TypeMismatch` with table/column context.
    pub fn coerce(raw: Option<&serde_json::Value>, ty: AttributeType) -> Result<Value, String> {
        use serde_json::Value as Json;

        let raw = match raw {
            None | Some(Json::Null) => return Ok(Value::Null),
            Some(raw) => raw,
        };

        if let Json::String(s) = raw {
            if s.trim().is_empty() {
                return Ok(Value::Null);
            }
        }

        match (ty, raw) {
            (AttributeType::Text, Json::String(s)) => Ok(Value::Text(s.trim().to_string())),
            (AttributeType::Text, Json::Number(n)) => Ok(Value::Text(n.to_string())),
            (AttributeType::Text, Json::Bool(b)) => Ok(Value::Text(b.to_string())),

            (AttributeType::Integer, Json::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(whole_number))
                .map(Value::Integer)
                .ok_or_else(|| n.to_string()),
            (AttributeType::Integer, Json::String(s)) => parse_integer(s.trim())
                .map(Value::Integer)
                .ok_or_else(|| s.clone()),

            (AttributeType::Decimal, Json::Number(n)) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map(Value::Decimal)
                .ok_or_else(|| n.to_string()),
            (AttributeType::Decimal, Json::String(s)) => parse_decimal(s.trim())
                .map(Value::Decimal)
                .ok_or_else(|| s.clone()),

            (AttributeType::Date, Json::String(s)) => parse_date(s.trim())
                .map(Value::Date)
                .ok_or_else(|| s.clone()),

            (_, other) => Err(other.to_string()),
        }
    }

    /// Decode a stored SQLite value back into a typed value.
    ///
    /// Tables created by an external script may declare other affinities
    /// (`VARCHAR` amounts, `NUMERIC` phone numbers), so every storage class
    /// is accepted as long as it parses as the column's type.
    pub fn decode(ty: AttributeType, raw: ValueRef<'_>) -> FromSqlResult<Value> {
        match (ty, raw) {
            (_, ValueRef::Null) => Ok(Value::Null),

            (AttributeType::Text, ValueRef::Text(_)) => Ok(Value::Text(raw.as_str()?.to_string())),
            (AttributeType::Text, ValueRef::Integer(i)) => Ok(Value::Text(i.to_string())),
            (AttributeType::Text, ValueRef::Real(f)) => Ok(Value::Text(f.to_string())),

            (AttributeType::Integer, ValueRef::Integer(i)) => Ok(Value::Integer(i)),
            (AttributeType::Integer, ValueRef::Real(f)) => whole_number(f)
                .map(Value::Integer)
                .ok_or(FromSqlError::InvalidType),
            (AttributeType::Integer, ValueRef::Text(_)) => parse_integer(raw.as_str()?.trim())
                .map(Value::Integer)
                .ok_or(FromSqlError::InvalidType),

            (AttributeType::Decimal, ValueRef::Real(f)) => Ok(Value::Decimal(f)),
            (AttributeType::Decimal, ValueRef::Integer(i)) => Ok(Value::Decimal(i as f64)),
            (AttributeType::Decimal, ValueRef::Text(_)) => parse_decimal(raw.as_str()?.trim())
                .map(Value::Decimal)
                .ok_or(FromSqlError::InvalidType),

            (AttributeType::Date, ValueRef::Text(_)) => parse_date(raw.as_str()?.trim())
                .map(Value::Date)
                .ok_or(FromSqlError::InvalidType),

            _ => Err(FromSqlError::InvalidType),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d.format(DATE_STORAGE_FORMAT)),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqlValue;

        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Decimal(d) => ToSqlOutput::Owned(SqlValue::Real(*d)),
            Value::Date(d) => {
                ToSqlOutput::Owned(SqlValue::Text(d.format(DATE_STORAGE_FORMAT).to_string()))
            }
        })
    }
}

// ============================================================================
// PARSING HELPERS
// ============================================================================

/// Normalize a column name: trim, lower-case, spaces to underscores
///
/// Example: "Holder Phone Number" → "holder_phone_number"
pub fn normalize_column_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn whole_number(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_integer(s: &str) -> Option<i64> {
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().and_then(whole_number))
}

/// Parse amounts like "1500", "1,500.25" or "$1,500.25"
fn parse_decimal(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| *c != ',' && *c != '$')
        .collect();

    cleaned.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_column_name() {
        assert_eq!(normalize_column_name("Holder ID"), "holder_id");
        assert_eq!(normalize_column_name("  Days Of  Payment Delay "), "days_of_payment_delay");
        assert_eq!(normalize_column_name("carrier_name"), "carrier_name");
    }

    #[test]
    fn test_blank_and_missing_become_null() {
        assert_eq!(Value::coerce(None, AttributeType::Integer), Ok(Value::Null));
        assert_eq!(Value::coerce(Some(&json!(null)), AttributeType::Text), Ok(Value::Null));
        assert_eq!(Value::coerce(Some(&json!("   ")), AttributeType::Date), Ok(Value::Null));
    }

    #[test]
    fn test_coerce_integer() {
        assert_eq!(Value::coerce(Some(&json!("42")), AttributeType::Integer), Ok(Value::Integer(42)));
        assert_eq!(Value::coerce(Some(&json!(42)), AttributeType::Integer), Ok(Value::Integer(42)));
        assert_eq!(Value::coerce(Some(&json!("35.0")), AttributeType::Integer), Ok(Value::Integer(35)));
        assert_eq!(
            Value::coerce(Some(&json!("35.5")), AttributeType::Integer),
            Err("35.5".to_string())
        );
        assert_eq!(
            Value::coerce(Some(&json!("forty")), AttributeType::Integer),
            Err("forty".to_string())
        );
    }

    #[test]
    fn test_coerce_decimal() {
        assert_eq!(
            Value::coerce(Some(&json!("$1,500.25")), AttributeType::Decimal),
            Ok(Value::Decimal(1500.25))
        );
        assert_eq!(Value::coerce(Some(&json!(12.5)), AttributeType::Decimal), Ok(Value::Decimal(12.5)));
        assert!(Value::coerce(Some(&json!("NaN")), AttributeType::Decimal).is_err());
        assert!(Value::coerce(Some(&json!("abc")), AttributeType::Decimal).is_err());
    }

    #[test]
    fn test_coerce_date_formats() {
        let expected = Value::Date(NaiveDate::from_ymd_opt(2024, 11, 16).unwrap());

        assert_eq!(Value::coerce(Some(&json!("2024-11-16")), AttributeType::Date), Ok(expected.clone()));
        assert_eq!(Value::coerce(Some(&json!("11/16/2024")), AttributeType::Date), Ok(expected.clone()));
        assert_eq!(Value::coerce(Some(&json!("16-11-2024")), AttributeType::Date), Ok(expected));
        assert!(Value::coerce(Some(&json!("2024-13-40")), AttributeType::Date).is_err());
        assert!(Value::coerce(Some(&json!(20241116)), AttributeType::Date).is_err());
    }

    #[test]
    fn test_coerce_text_from_number() {
        assert_eq!(
            Value::coerce(Some(&json!(1001)), AttributeType::Text),
            Ok(Value::Text("1001".to_string()))
        );
        assert_eq!(
            Value::coerce(Some(&json!("  Ana  ")), AttributeType::Text),
            Ok(Value::Text("Ana".to_string()))
        );
        assert!(Value::coerce(Some(&json!(["a"])), AttributeType::Text).is_err());
    }

    #[test]
    fn test_decode_stored_values() {
        assert_eq!(
            Value::decode(AttributeType::Decimal, ValueRef::Integer(1500)).unwrap(),
            Value::Decimal(1500.0)
        );
        assert_eq!(
            Value::decode(AttributeType::Date, ValueRef::Text(b"2024-01-31")).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
        );
        assert_eq!(Value::decode(AttributeType::Integer, ValueRef::Null).unwrap(), Value::Null);
        assert!(Value::decode(AttributeType::Integer, ValueRef::Text(b"x")).is_err());
    }

    #[test]
    fn test_decode_tolerates_foreign_affinity() {
        // VARCHAR amount, NUMERIC phone number, REAL-typed age
        assert_eq!(
            Value::decode(AttributeType::Decimal, ValueRef::Text(b"2500.5")).unwrap(),
            Value::Decimal(2500.5)
        );
        assert_eq!(
            Value::decode(AttributeType::Text, ValueRef::Real(12.5)).unwrap(),
            Value::Text("12.5".to_string())
        );
        assert_eq!(
            Value::decode(AttributeType::Integer, ValueRef::Real(34.0)).unwrap(),
            Value::Integer(34)
        );
        assert_eq!(
            Value::decode(AttributeType::Integer, ValueRef::Text(b"34")).unwrap(),
            Value::Integer(34)
        );
        assert!(Value::decode(AttributeType::Integer, ValueRef::Real(34.5)).is_err());
        assert!(Value::decode(AttributeType::Date, ValueRef::Integer(20240131)).is_err());
    }

    #[test]
    fn test_value_serializes_untagged() {
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
        assert_eq!(serde_json::to_value(&date).unwrap(), json!("2024-01-31"));
        assert_eq!(serde_json::to_value(Value::Integer(34)).unwrap(), json!(34));
        assert_eq!(serde_json::to_value(Value::Null).unwrap(), json!(null));
    }
}
