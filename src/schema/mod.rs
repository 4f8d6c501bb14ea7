//! Schema module - structural descriptions of dataplane API messages
//!
//! Schemas are explicit data, not annotations on value types:
//! - A message is an ordered sequence of field layouts
//! - Each schema carries a CRC32 fingerprint of its wire shape
//! - Modules group schemas under one name/version/CRC namespace
//!
//! The fingerprint is the compatibility contract exchanged with the
//! dataplane at connection setup: two ends agree on a message's wire
//! layout exactly when their fingerprints match.

mod source;

pub use source::*;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Schema construction and loading errors
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("field '{field}' of '{owner}': count reference '{count}' does not name a preceding field")]
    UnknownCountField {
        owner: String,
        field: String,
        count: String,
    },

    #[error("field '{field}' of '{owner}': count field '{count}' must be a plain unsigned scalar")]
    BadCountField {
        owner: String,
        field: String,
        count: String,
    },

    #[error("'{owner}': declared CRC {declared:#010x} does not match computed fingerprint {computed:#010x}")]
    FingerprintMismatch {
        owner: String,
        declared: u32,
        computed: u32,
    },

    #[error("module '{module}': duplicate message name '{message}'")]
    DuplicateMessage { module: String, message: String },

    #[error("struct type '{0}' has no fields and no wire width")]
    EmptyStruct(String),

    #[error("field '{field}' of '{owner}': fixed array length must be nonzero")]
    ZeroLengthArray { owner: String, field: String },

    #[error("unknown scalar or type name: '{0}'")]
    UnknownType(String),

    #[error("invalid CRC string '{0}'")]
    InvalidCrc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Fixed-width scalar kinds supported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F64,
}

impl ScalarKind {
    /// Encoded width in bytes
    pub fn width(&self) -> usize {
        match self {
            ScalarKind::U8 | ScalarKind::I8 => 1,
            ScalarKind::U16 | ScalarKind::I16 => 2,
            ScalarKind::U32 | ScalarKind::I32 => 4,
            ScalarKind::U64 | ScalarKind::I64 | ScalarKind::F64 => 8,
        }
    }

    /// Whether this kind can carry an element count
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            ScalarKind::U8 | ScalarKind::U16 | ScalarKind::U32 | ScalarKind::U64
        )
    }

    /// Canonical lowercase name, as used by the schema source format
    pub fn name(&self) -> &'static str {
        match self {
            ScalarKind::U8 => "u8",
            ScalarKind::U16 => "u16",
            ScalarKind::U32 => "u32",
            ScalarKind::U64 => "u64",
            ScalarKind::I8 => "i8",
            ScalarKind::I16 => "i16",
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::F64 => "f64",
        }
    }

    /// Parse a canonical scalar name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "u8" => Some(ScalarKind::U8),
            "u16" => Some(ScalarKind::U16),
            "u32" => Some(ScalarKind::U32),
            "u64" => Some(ScalarKind::U64),
            "i8" => Some(ScalarKind::I8),
            "i16" => Some(ScalarKind::I16),
            "i32" => Some(ScalarKind::I32),
            "i64" => Some(ScalarKind::I64),
            "f64" => Some(ScalarKind::F64),
            _ => None,
        }
    }
}

/// How a field repeats on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayMode {
    /// Single value
    None,
    /// Exactly `n` elements. Shorter input is zero-padded, longer input
    /// is truncated - a lossy policy inherited from the wire protocol.
    /// Callers that must not lose data validate length before encoding.
    Fixed(usize),
    /// Variable length, preceded by the named unsigned count field.
    /// The count field must be declared earlier in the same layout.
    CountedBy(String),
}

/// Element type of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarKind),
    Struct(Arc<StructLayout>),
}

/// Wire representation of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub kind: FieldKind,
    pub array: ArrayMode,
}

impl FieldLayout {
    /// Single scalar field
    pub fn scalar(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(kind),
            array: ArrayMode::None,
        }
    }

    /// Fixed-width byte array field
    pub fn bytes(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(ScalarKind::U8),
            array: ArrayMode::Fixed(width),
        }
    }

    /// Counted variable-length array of scalars
    pub fn counted(
        name: impl Into<String>,
        kind: ScalarKind,
        count_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(kind),
            array: ArrayMode::CountedBy(count_field.into()),
        }
    }

    /// Single nested struct field
    pub fn nested(name: impl Into<String>, layout: Arc<StructLayout>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Struct(layout),
            array: ArrayMode::None,
        }
    }

    /// Counted variable-length array of nested structs
    pub fn counted_nested(
        name: impl Into<String>,
        layout: Arc<StructLayout>,
        count_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Struct(layout),
            array: ArrayMode::CountedBy(count_field.into()),
        }
    }

    fn digest(&self, hasher: &mut crc32fast::Hasher) {
        hasher.update(self.name.as_bytes());
        hasher.update(&[0x00]);
        match &self.kind {
            FieldKind::Scalar(kind) => {
                hasher.update(&[0x01]);
                hasher.update(kind.name().as_bytes());
            }
            FieldKind::Struct(layout) => {
                hasher.update(&[0x02]);
                layout.digest(hasher);
            }
        }
        match &self.array {
            ArrayMode::None => hasher.update(&[0x00]),
            ArrayMode::Fixed(n) => {
                hasher.update(&[0x01]);
                hasher.update(&(*n as u32).to_be_bytes());
            }
            ArrayMode::CountedBy(count) => {
                hasher.update(&[0x02]);
                hasher.update(count.as_bytes());
            }
        }
        hasher.update(&[0xff]);
    }
}

/// Named sub-structure usable as a field element type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    /// Build a struct type; at least one field is required, so every
    /// struct element occupies at least one wire byte
    pub fn new(name: impl Into<String>, fields: Vec<FieldLayout>) -> SchemaResult<Self> {
        let name = name.into();
        if fields.is_empty() {
            return Err(SchemaError::EmptyStruct(name));
        }
        validate_fields(&name, &fields)?;
        Ok(Self { name, fields })
    }

    fn digest(&self, hasher: &mut crc32fast::Hasher) {
        hasher.update(self.name.as_bytes());
        hasher.update(&[0x00]);
        for field in &self.fields {
            field.digest(hasher);
        }
    }
}

/// Role of a message in the exchange protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Sent by the client, expects a reply (or a stream of details)
    Request,
    /// Sent by the dataplane in response to a request
    Reply,
    /// Sent by the dataplane unsolicited, after a want-toggle enabled it
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Reply => write!(f, "reply"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Structural description of one message
///
/// The `crc` is computed from the field sequence at construction time;
/// it changes exactly when the wire shape changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchema {
    pub name: String,
    pub kind: MessageKind,
    pub crc: u32,
    pub fields: Vec<FieldLayout>,
}

impl MessageSchema {
    pub fn new(
        name: impl Into<String>,
        kind: MessageKind,
        fields: Vec<FieldLayout>,
    ) -> SchemaResult<Self> {
        let name = name.into();
        validate_fields(&name, &fields)?;
        let crc = fingerprint(&name, kind, &fields);
        Ok(Self {
            name,
            kind,
            crc,
            fields,
        })
    }
}

/// Immutable group of message schemas sharing one version/CRC namespace
///
/// Constructed once at process start from static schema data and owned
/// by the registry thereafter.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub api_version: String,
    pub module_crc: u32,
    messages: Vec<Arc<MessageSchema>>,
    types: Vec<Arc<StructLayout>>,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        api_version: impl Into<String>,
        messages: Vec<MessageSchema>,
    ) -> SchemaResult<Self> {
        Self::with_types(name, api_version, Vec::new(), messages)
    }

    pub fn with_types(
        name: impl Into<String>,
        api_version: impl Into<String>,
        types: Vec<Arc<StructLayout>>,
        messages: Vec<MessageSchema>,
    ) -> SchemaResult<Self> {
        let name = name.into();
        let mut seen: Vec<&str> = Vec::with_capacity(messages.len());
        for message in &messages {
            if seen.contains(&message.name.as_str()) {
                return Err(SchemaError::DuplicateMessage {
                    module: name,
                    message: message.name.clone(),
                });
            }
            seen.push(&message.name);
        }
        let messages: Vec<Arc<MessageSchema>> = messages.into_iter().map(Arc::new).collect();
        let module_crc = combine_crcs(&messages);
        Ok(Self {
            name,
            api_version: api_version.into(),
            module_crc,
            messages,
            types,
        })
    }

    /// All message schemas in this module
    pub fn messages(&self) -> &[Arc<MessageSchema>] {
        &self.messages
    }

    /// Named sub-struct types declared by this module
    pub fn types(&self) -> &[Arc<StructLayout>] {
        &self.types
    }

    /// Look up one message schema by name
    pub fn message(&self, name: &str) -> Option<&Arc<MessageSchema>> {
        self.messages.iter().find(|m| m.name == name)
    }
}

/// Compute the structural fingerprint of a field sequence
fn fingerprint(name: &str, kind: MessageKind, fields: &[FieldLayout]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(&[match kind {
        MessageKind::Request => 0x01,
        MessageKind::Reply => 0x02,
        MessageKind::Event => 0x03,
    }]);
    for field in fields {
        field.digest(&mut hasher);
    }
    hasher.finalize()
}

/// Combine member message CRCs into a module CRC
///
/// Hashed in name order so the result does not depend on declaration
/// order, only on the set of (name, crc) pairs.
fn combine_crcs(messages: &[Arc<MessageSchema>]) -> u32 {
    let mut pairs: Vec<(&str, u32)> = messages.iter().map(|m| (m.name.as_str(), m.crc)).collect();
    pairs.sort_unstable();
    let mut hasher = crc32fast::Hasher::new();
    for (name, crc) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(&crc.to_be_bytes());
    }
    hasher.finalize()
}

/// Check that fixed arrays have a nonzero length and that every
/// counted array references a preceding plain unsigned scalar in the
/// same layout
fn validate_fields(owner: &str, fields: &[FieldLayout]) -> SchemaResult<()> {
    for (index, field) in fields.iter().enumerate() {
        if field.array == ArrayMode::Fixed(0) {
            return Err(SchemaError::ZeroLengthArray {
                owner: owner.to_string(),
                field: field.name.clone(),
            });
        }
        if let ArrayMode::CountedBy(count) = &field.array {
            let referenced = fields[..index].iter().find(|f| &f.name == count);
            match referenced {
                None => {
                    return Err(SchemaError::UnknownCountField {
                        owner: owner.to_string(),
                        field: field.name.clone(),
                        count: count.clone(),
                    });
                }
                Some(counter) => {
                    let plain_unsigned = matches!(
                        &counter.kind,
                        FieldKind::Scalar(kind) if kind.is_unsigned()
                    ) && counter.array == ArrayMode::None;
                    if !plain_unsigned {
                        return Err(SchemaError::BadCountField {
                            owner: owner.to_string(),
                            field: field.name.clone(),
                            count: count.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}
