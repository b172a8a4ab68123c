//! Database value types
//!
//! This module defines the values passed as statement parameters and returned in
//! result rows, plus the result set shapes on both sides of the conversion bridge.

use super::convert::WireType;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Database value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit floating point
    Float(f32),
    /// 64-bit floating point
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp (Unix timestamp in microseconds, UTC)
    Timestamp(i64),
    /// JSON document
    Json(serde_json::Value),
    /// Caller-defined domain value; needs a registered writer before it can be sent
    #[serde(skip)]
    Custom(CustomValue),
}

impl DatabaseValue {
    /// Wrap a caller-defined domain value
    pub fn custom<T: DomainValue>(value: T) -> Self {
        DatabaseValue::Custom(CustomValue::new(value))
    }

    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v != 0),
            DatabaseValue::Long(v) => Some(*v != 0),
            DatabaseValue::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(true),
                "false" | "f" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the value as an i32
    pub fn as_int(&self) -> Option<i32> {
        match self {
            DatabaseValue::Int(v) => Some(*v),
            DatabaseValue::Long(v) => i32::try_from(*v).ok(),
            DatabaseValue::String(s) => s.parse().ok(),
            DatabaseValue::Bool(v) => Some(*v as i32),
            _ => None,
        }
    }

    /// Get the value as an i64
    pub fn as_long(&self) -> Option<i64> {
        match self {
            DatabaseValue::Long(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v as i64),
            DatabaseValue::String(s) => s.parse().ok(),
            DatabaseValue::Bool(v) => Some(*v as i64),
            DatabaseValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as an f64
    pub fn as_double(&self) -> Option<f64> {
        match self {
            DatabaseValue::Double(v) => Some(*v),
            DatabaseValue::Float(v) => Some(*v as f64),
            DatabaseValue::Int(v) => Some(*v as f64),
            DatabaseValue::Long(v) => Some(*v as f64),
            DatabaseValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get the value as a string slice (zero-copy for String values)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get the value as a string (with conversion)
    pub fn as_string(&self) -> String {
        match self {
            DatabaseValue::Null => "null".to_string(),
            DatabaseValue::Bool(v) => v.to_string(),
            DatabaseValue::Int(v) => v.to_string(),
            DatabaseValue::Long(v) => v.to_string(),
            DatabaseValue::Float(v) => v.to_string(),
            DatabaseValue::Double(v) => v.to_string(),
            DatabaseValue::String(s) => s.clone(),
            DatabaseValue::Bytes(b) => format!("<{} bytes>", b.len()),
            DatabaseValue::Timestamp(v) => v.to_string(),
            DatabaseValue::Json(v) => v.to_string(),
            DatabaseValue::Custom(c) => format!("{:?}", c),
        }
    }

    /// Get the value as bytes (zero-copy)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Bytes(b) => Some(b),
            DatabaseValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get a timestamp value as a UTC date-time
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DatabaseValue::Timestamp(micros) => Utc.timestamp_micros(*micros).single(),
            _ => None,
        }
    }

    /// Get the JSON document, if this is one
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            DatabaseValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow a custom domain value as `T`
    pub fn as_custom<T: Any>(&self) -> Option<&T> {
        match self {
            DatabaseValue::Custom(c) => c.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Whether the driver can send this value without a registered writer
    pub fn is_wire_compatible(&self) -> bool {
        !matches!(self, DatabaseValue::Custom(_))
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Bool(_) => "bool",
            DatabaseValue::Int(_) => "int",
            DatabaseValue::Long(_) => "long",
            DatabaseValue::Float(_) => "float",
            DatabaseValue::Double(_) => "double",
            DatabaseValue::String(_) => "string",
            DatabaseValue::Bytes(_) => "bytes",
            DatabaseValue::Timestamp(_) => "timestamp",
            DatabaseValue::Json(_) => "json",
            DatabaseValue::Custom(_) => "custom",
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(v: bool) -> Self {
        DatabaseValue::Bool(v)
    }
}

impl From<i32> for DatabaseValue {
    fn from(v: i32) -> Self {
        DatabaseValue::Int(v)
    }
}

impl From<i64> for DatabaseValue {
    fn from(v: i64) -> Self {
        DatabaseValue::Long(v)
    }
}

impl From<f32> for DatabaseValue {
    fn from(v: f32) -> Self {
        DatabaseValue::Float(v)
    }
}

impl From<f64> for DatabaseValue {
    fn from(v: f64) -> Self {
        DatabaseValue::Double(v)
    }
}

impl From<String> for DatabaseValue {
    fn from(v: String) -> Self {
        DatabaseValue::String(v)
    }
}

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(v: Vec<u8>) -> Self {
        DatabaseValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(v: DateTime<Utc>) -> Self {
        DatabaseValue::Timestamp(v.timestamp_micros())
    }
}

impl From<serde_json::Value> for DatabaseValue {
    fn from(v: serde_json::Value) -> Self {
        DatabaseValue::Json(v)
    }
}

impl From<CustomValue> for DatabaseValue {
    fn from(v: CustomValue) -> Self {
        DatabaseValue::Custom(v)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A caller-defined value type that can ride inside [`DatabaseValue::Custom`]
///
/// Implemented for every `Debug + PartialEq + Send + Sync + 'static` type.
pub trait DomainValue: Any + fmt::Debug + Send + Sync {
    /// Upcast for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Equality across the type-erased boundary
    fn dyn_eq(&self, other: &dyn DomainValue) -> bool;

    /// Rust type name of the wrapped value
    fn domain_type_name(&self) -> &'static str;
}

impl<T> DomainValue for T
where
    T: Any + fmt::Debug + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DomainValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn domain_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Type-erased, cheaply cloneable domain value
#[derive(Clone)]
pub struct CustomValue(Arc<dyn DomainValue>);

impl CustomValue {
    /// Wrap a domain value
    pub fn new<T: DomainValue>(value: T) -> Self {
        CustomValue(Arc::new(value))
    }

    /// Borrow the wrapped value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Check whether the wrapped value is a `T`
    pub fn is<T: Any>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    /// Rust type name of the wrapped value
    pub fn type_name(&self) -> &'static str {
        self.0.domain_type_name()
    }
}

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(&*other.0)
    }
}

/// A row of database results (column name -> value mapping)
///
/// Column names are unique within a row; if a statement returns two columns with
/// the same name, the later one wins.
pub type Row = HashMap<String, DatabaseValue>;

/// Outcome of a statement after result values passed through the conversion bridge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Affected-row count for mutating statements
    pub updated: u64,
    /// Returned rows, empty unless the statement returns data
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// First row, if any
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Value of `column` in the first row
    pub fn scalar(&self, column: &str) -> Option<&DatabaseValue> {
        self.first().and_then(|row| row.get(column))
    }
}

/// Column metadata reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub wire_type: WireType,
}

impl Column {
    pub fn new(name: impl Into<String>, wire_type: WireType) -> Self {
        Self {
            name: name.into(),
            wire_type,
        }
    }
}

/// Result set as produced by an executor, before the read path of the bridge runs
///
/// Every row holds one value per entry of `columns`, in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResultSet {
    pub updated: u64,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<DatabaseValue>>,
}

impl RawResultSet {
    /// Result of a statement that returns no data
    pub fn updated(updated: u64) -> Self {
        Self {
            updated,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Money {
        cents: i64,
    }

    #[test]
    fn test_value_conversions() {
        let val = DatabaseValue::Int(42);
        assert_eq!(val.as_int(), Some(42));
        assert_eq!(val.as_long(), Some(42));
        assert_eq!(val.as_string(), "42");

        let val = DatabaseValue::String("123".to_string());
        assert_eq!(val.as_int(), Some(123));

        let val = DatabaseValue::String("t".to_string());
        assert_eq!(val.as_bool(), Some(true));
    }

    #[test]
    fn test_value_from_types() {
        let val: DatabaseValue = "screwdriver".into();
        assert_eq!(val, DatabaseValue::String("screwdriver".to_string()));

        let val: DatabaseValue = Some(15).into();
        assert_eq!(val, DatabaseValue::Int(15));

        let val: DatabaseValue = Option::<i64>::None.into();
        assert_eq!(val, DatabaseValue::Null);

        let val: DatabaseValue = serde_json::json!({"a": 1}).into();
        assert_eq!(val.type_name(), "json");
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc.timestamp_micros(1_700_000_000_123_456).single().unwrap();
        let val = DatabaseValue::from(now);
        assert_eq!(val.as_datetime(), Some(now));
    }

    #[test]
    fn test_custom_value_equality() {
        let a = DatabaseValue::custom(Money { cents: 150 });
        let b = DatabaseValue::custom(Money { cents: 150 });
        let c = DatabaseValue::custom(Money { cents: 151 });
        let d = DatabaseValue::custom(150i64);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(!a.is_wire_compatible());
        assert_eq!(a.as_custom::<Money>(), Some(&Money { cents: 150 }));
        assert_eq!(a.as_custom::<i64>(), None);
    }

    #[test]
    fn test_custom_is_not_serializable() {
        let val = DatabaseValue::custom(Money { cents: 1 });
        assert!(serde_json::to_string(&val).is_err());
        assert!(serde_json::to_string(&DatabaseValue::Long(1)).is_ok());
    }
}
