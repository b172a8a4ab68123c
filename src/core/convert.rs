//! Value conversion bridge
//!
//! Two directions, two dispatch strategies:
//!
//! - **Read**: the driver tags every column with a [`WireType`]; a reader registered
//!   for that tag turns the raw value into a domain value. Untagged columns pass
//!   through unchanged.
//! - **Write**: writers are `(matcher, writer)` pairs tried in registration order;
//!   the first matcher that accepts a parameter converts it. Parameters nobody
//!   claims are sent as-is when the driver can encode them, otherwise the call
//!   fails with [`DatabaseError::Conversion`].
//!
//! A registry is built once, then frozen inside an `Arc` when the pool opens, so it
//! cannot change while queries are running.

use super::error::{DatabaseError, Result};
use super::value::{DatabaseValue, RawResultSet, ResultSet, Row};
use std::collections::HashMap;
use std::fmt;

/// PostgreSQL wire type tag used to pick a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Varchar,
    Bpchar,
    Name,
    Bytea,
    Json,
    Jsonb,
    Timestamp,
    Timestamptz,
    Date,
    Time,
    Numeric,
    Uuid,
    /// Any other type, identified by its OID
    Other(u32),
}

impl WireType {
    /// Map a PostgreSQL type OID to its tag
    pub fn from_oid(oid: u32) -> Self {
        match oid {
            16 => WireType::Bool,
            17 => WireType::Bytea,
            19 => WireType::Name,
            20 => WireType::Int8,
            21 => WireType::Int2,
            23 => WireType::Int4,
            25 => WireType::Text,
            114 => WireType::Json,
            700 => WireType::Float4,
            701 => WireType::Float8,
            1042 => WireType::Bpchar,
            1043 => WireType::Varchar,
            1082 => WireType::Date,
            1083 => WireType::Time,
            1114 => WireType::Timestamp,
            1184 => WireType::Timestamptz,
            1700 => WireType::Numeric,
            2950 => WireType::Uuid,
            3802 => WireType::Jsonb,
            other => WireType::Other(other),
        }
    }

    /// PostgreSQL type OID of this tag
    pub fn oid(&self) -> u32 {
        match self {
            WireType::Bool => 16,
            WireType::Bytea => 17,
            WireType::Name => 19,
            WireType::Int8 => 20,
            WireType::Int2 => 21,
            WireType::Int4 => 23,
            WireType::Text => 25,
            WireType::Json => 114,
            WireType::Float4 => 700,
            WireType::Float8 => 701,
            WireType::Bpchar => 1042,
            WireType::Varchar => 1043,
            WireType::Date => 1082,
            WireType::Time => 1083,
            WireType::Timestamp => 1114,
            WireType::Timestamptz => 1184,
            WireType::Numeric => 1700,
            WireType::Uuid => 2950,
            WireType::Jsonb => 3802,
            WireType::Other(oid) => *oid,
        }
    }
}

type Reader = Box<dyn Fn(DatabaseValue) -> Result<DatabaseValue> + Send + Sync>;
type Matcher = Box<dyn Fn(&DatabaseValue) -> bool + Send + Sync>;
type Writer = Box<dyn Fn(&DatabaseValue) -> Result<DatabaseValue> + Send + Sync>;

/// Registry of readers (by wire type) and writers (by value shape)
#[derive(Default)]
pub struct ConverterRegistry {
    readers: HashMap<WireType, Reader>,
    writers: Vec<(Matcher, Writer)>,
}

impl ConverterRegistry {
    /// Create an empty registry; every value passes through unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the reader for a wire type, replacing any previous one
    pub fn register_reader<F>(&mut self, wire_type: WireType, reader: F) -> &mut Self
    where
        F: Fn(DatabaseValue) -> Result<DatabaseValue> + Send + Sync + 'static,
    {
        self.readers.insert(wire_type, Box::new(reader));
        self
    }

    /// Register a writer; matchers are tried in registration order
    pub fn register_writer<M, F>(&mut self, matcher: M, writer: F) -> &mut Self
    where
        M: Fn(&DatabaseValue) -> bool + Send + Sync + 'static,
        F: Fn(&DatabaseValue) -> Result<DatabaseValue> + Send + Sync + 'static,
    {
        self.writers.push((Box::new(matcher), Box::new(writer)));
        self
    }

    /// Builder-style [`register_reader`](Self::register_reader)
    #[must_use]
    pub fn with_reader<F>(mut self, wire_type: WireType, reader: F) -> Self
    where
        F: Fn(DatabaseValue) -> Result<DatabaseValue> + Send + Sync + 'static,
    {
        self.register_reader(wire_type, reader);
        self
    }

    /// Builder-style [`register_writer`](Self::register_writer)
    #[must_use]
    pub fn with_writer<M, F>(mut self, matcher: M, writer: F) -> Self
    where
        M: Fn(&DatabaseValue) -> bool + Send + Sync + 'static,
        F: Fn(&DatabaseValue) -> Result<DatabaseValue> + Send + Sync + 'static,
    {
        self.register_writer(matcher, writer);
        self
    }

    /// Convert one raw column value into a domain value
    pub fn read(&self, wire_type: WireType, raw: DatabaseValue) -> Result<DatabaseValue> {
        // NULL never reaches a reader
        if raw.is_null() {
            return Ok(raw);
        }
        match self.readers.get(&wire_type) {
            Some(reader) => reader(raw),
            None => Ok(raw),
        }
    }

    /// Convert one domain value into something the driver can encode
    pub fn write(&self, value: &DatabaseValue) -> Result<DatabaseValue> {
        if let Some((_, writer)) = self.writers.iter().find(|(matches, _)| matches(value)) {
            let wire = writer(value)?;
            if !wire.is_wire_compatible() {
                return Err(DatabaseError::conversion(format!(
                    "writer for {} produced a value the driver cannot encode",
                    describe(value)
                )));
            }
            return Ok(wire);
        }
        if value.is_wire_compatible() {
            Ok(value.clone())
        } else {
            Err(DatabaseError::conversion(format!(
                "no writer registered for {}",
                describe(value)
            )))
        }
    }

    /// Convert a full parameter list, failing on the first unconvertible value
    pub fn write_all(&self, params: &[DatabaseValue]) -> Result<Vec<DatabaseValue>> {
        params.iter().map(|value| self.write(value)).collect()
    }

    /// Run the read path over a driver result set
    pub fn read_result_set(&self, raw: RawResultSet) -> Result<ResultSet> {
        let RawResultSet {
            updated,
            columns,
            rows,
        } = raw;

        let mut converted = Vec::with_capacity(rows.len());
        for values in rows {
            if values.len() != columns.len() {
                return Err(DatabaseError::driver_message(format!(
                    "row has {} values for {} columns",
                    values.len(),
                    columns.len()
                )));
            }
            let mut row = Row::with_capacity(columns.len());
            for (column, value) in columns.iter().zip(values) {
                row.insert(column.name.clone(), self.read(column.wire_type, value)?);
            }
            converted.push(row);
        }

        Ok(ResultSet {
            updated,
            rows: converted,
        })
    }

    /// Number of registered readers
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Number of registered writers
    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.len())
            .finish()
    }
}

fn describe(value: &DatabaseValue) -> String {
    match value {
        DatabaseValue::Custom(c) => format!("custom value of type {}", c.type_name()),
        other => format!("{} value", other.type_name()),
    }
}
