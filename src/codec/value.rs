//! Dynamic value model
//!
//! Schemas are data, so encode/decode operate on ordered field records
//! rather than per-message structs. A `Record` holds one message (or
//! nested struct) worth of named values in schema field order.

use crate::schema::{ArrayMode, FieldKind, FieldLayout, ScalarKind};

/// One decoded or to-be-encoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    /// Raw bytes: fixed-width or counted `u8` arrays
    Bytes(Vec<u8>),
    /// Repeated scalar or struct elements
    List(Vec<Value>),
    /// Nested sub-structure
    Struct(Record),
}

impl Value {
    /// Unsigned view of an integer value
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Signed view of an integer value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Element count of an array value
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Bytes(b) => Some(b.len()),
            Value::List(l) => Some(l.len()),
            _ => None,
        }
    }

    /// Zero value for a scalar kind
    pub fn zero(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::U8 => Value::U8(0),
            ScalarKind::U16 => Value::U16(0),
            ScalarKind::U32 => Value::U32(0),
            ScalarKind::U64 => Value::U64(0),
            ScalarKind::I8 => Value::I8(0),
            ScalarKind::I16 => Value::I16(0),
            ScalarKind::I32 => Value::I32(0),
            ScalarKind::I64 => Value::I64(0),
            ScalarKind::F64 => Value::F64(0.0),
        }
    }
}

/// Ordered named field values for one message or nested struct
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the named field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Set a field, replacing any existing value under the same name
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder-style `set`
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Fields in insertion order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// All-zero record for a field layout sequence
    ///
    /// Used to pad fixed-length struct arrays and as a convenient
    /// starting point for callers that only set a few fields.
    pub fn zeroed(layout: &[FieldLayout]) -> Self {
        let mut record = Record::new();
        for field in layout {
            let value = match (&field.kind, &field.array) {
                (FieldKind::Scalar(ScalarKind::U8), ArrayMode::Fixed(n)) => {
                    Value::Bytes(vec![0; *n])
                }
                (FieldKind::Scalar(kind), ArrayMode::None) => Value::zero(*kind),
                (FieldKind::Scalar(kind), ArrayMode::Fixed(n)) => {
                    Value::List(vec![Value::zero(*kind); *n])
                }
                (FieldKind::Struct(layout), ArrayMode::None) => {
                    Value::Struct(Record::zeroed(&layout.fields))
                }
                (FieldKind::Struct(layout), ArrayMode::Fixed(n)) => Value::List(vec![
                    Value::Struct(Record::zeroed(&layout.fields));
                    *n
                ]),
                (FieldKind::Scalar(ScalarKind::U8), ArrayMode::CountedBy(_)) => {
                    Value::Bytes(Vec::new())
                }
                (_, ArrayMode::CountedBy(_)) => Value::List(Vec::new()),
            };
            record.set(field.name.clone(), value);
        }
        record
    }
}
