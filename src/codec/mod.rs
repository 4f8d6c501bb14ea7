//! Codec module - schema-driven binary encode/decode
//!
//! The wire format carries no type tags; a message's schema alone
//! determines its layout, so a registry lookup must precede every
//! decode. Layout rules, pinned to the dataplane protocol:
//! - Scalars are fixed-width, network byte order (big-endian)
//! - Fixed arrays hold exactly `n` elements: short input is zero-padded,
//!   long input is truncated
//! - Counted arrays follow an unsigned count field declared earlier in
//!   the schema; the count is always written from the actual element
//!   count supplied, never from a caller-provided value

mod value;

pub use value::{Record, Value};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::schema::{ArrayMode, FieldKind, FieldLayout, MessageSchema, ScalarKind};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Fewer bytes remain than a field's declared width, or a count
    /// field implies more elements than the remaining bytes can hold
    #[error("malformed message: field '{field}' needs {needed} bytes, {remaining} remaining")]
    Malformed {
        field: String,
        needed: usize,
        remaining: usize,
    },

    #[error("value of field '{field}' does not fit in {width} bytes")]
    ValueOutOfRange { field: String, width: usize },

    #[error("no value supplied for field '{field}'")]
    MissingField { field: String },

    #[error("field '{field}' expects {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },

    #[error("arrays sharing count field '{count}' have different lengths")]
    InconsistentCount { count: String },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encode a record to wire bytes per its schema
///
/// Deterministic and total over well-formed inputs: the same record and
/// schema always produce the same bytes.
pub fn encode(record: &Record, schema: &MessageSchema) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    encode_fields(&mut buf, &schema.fields, record)?;
    Ok(buf.freeze())
}

/// Decode wire bytes to a record per its schema
///
/// Bytes past the last field are ignored; the dataplane may pad
/// messages at the tail.
pub fn decode(payload: &[u8], schema: &MessageSchema) -> CodecResult<Record> {
    let mut reader = Reader { buf: payload };
    decode_fields(&mut reader, &schema.fields)
}

fn encode_fields(buf: &mut BytesMut, fields: &[FieldLayout], record: &Record) -> CodecResult<()> {
    for (index, field) in fields.iter().enumerate() {
        match &field.array {
            ArrayMode::None => match &field.kind {
                FieldKind::Scalar(kind) => {
                    // A count field is written from the arrays it
                    // governs, never from a caller-supplied value
                    if let Some(count) = governed_count(fields, index, record)? {
                        put_unsigned(buf, *kind, count, &field.name)?;
                    } else {
                        let value = required(record, &field.name)?;
                        put_scalar(buf, *kind, value, &field.name)?;
                    }
                }
                FieldKind::Struct(layout) => {
                    match required(record, &field.name)? {
                        Value::Struct(nested) => encode_fields(buf, &layout.fields, nested)?,
                        _ => {
                            return Err(CodecError::TypeMismatch {
                                field: field.name.clone(),
                                expected: "a struct value",
                            })
                        }
                    }
                }
            },
            ArrayMode::Fixed(width) => encode_fixed(buf, field, *width, record)?,
            ArrayMode::CountedBy(_) => encode_counted(buf, field, record)?,
        }
    }
    Ok(())
}

/// Exactly `width` elements: zero-pad short input, truncate long input
fn encode_fixed(
    buf: &mut BytesMut,
    field: &FieldLayout,
    width: usize,
    record: &Record,
) -> CodecResult<()> {
    match &field.kind {
        FieldKind::Scalar(ScalarKind::U8) => {
            let bytes = match record.get(&field.name) {
                None => &[][..],
                Some(Value::Bytes(bytes)) => bytes.as_slice(),
                Some(_) => {
                    return Err(CodecError::TypeMismatch {
                        field: field.name.clone(),
                        expected: "a byte array",
                    })
                }
            };
            let keep = bytes.len().min(width);
            buf.put_slice(&bytes[..keep]);
            buf.put_bytes(0, width - keep);
        }
        FieldKind::Scalar(kind) => {
            let elements = element_list(record, field)?;
            for element in elements.iter().take(width) {
                put_scalar(buf, *kind, element, &field.name)?;
            }
            if elements.len() < width {
                buf.put_bytes(0, (width - elements.len()) * kind.width());
            }
        }
        FieldKind::Struct(layout) => {
            let elements = element_list(record, field)?;
            for element in elements.iter().take(width) {
                match element {
                    Value::Struct(nested) => encode_fields(buf, &layout.fields, nested)?,
                    _ => {
                        return Err(CodecError::TypeMismatch {
                            field: field.name.clone(),
                            expected: "struct elements",
                        })
                    }
                }
            }
            if elements.len() < width {
                let zero = Record::zeroed(&layout.fields);
                for _ in elements.len()..width {
                    encode_fields(buf, &layout.fields, &zero)?;
                }
            }
        }
    }
    Ok(())
}

/// Counted elements; the count itself was written by the count field
fn encode_counted(buf: &mut BytesMut, field: &FieldLayout, record: &Record) -> CodecResult<()> {
    match &field.kind {
        FieldKind::Scalar(ScalarKind::U8) => match record.get(&field.name) {
            None => {}
            Some(Value::Bytes(bytes)) => buf.put_slice(bytes),
            Some(_) => {
                return Err(CodecError::TypeMismatch {
                    field: field.name.clone(),
                    expected: "a byte array",
                })
            }
        },
        FieldKind::Scalar(kind) => {
            for element in element_list(record, field)? {
                put_scalar(buf, *kind, element, &field.name)?;
            }
        }
        FieldKind::Struct(layout) => {
            for element in element_list(record, field)? {
                match element {
                    Value::Struct(nested) => encode_fields(buf, &layout.fields, nested)?,
                    _ => {
                        return Err(CodecError::TypeMismatch {
                            field: field.name.clone(),
                            expected: "struct elements",
                        })
                    }
                }
            }
        }
    }
    Ok(())
}

/// If the field at `index` is referenced as a count field, return the
/// element count of the arrays it governs
fn governed_count(
    fields: &[FieldLayout],
    index: usize,
    record: &Record,
) -> CodecResult<Option<u64>> {
    let name = &fields[index].name;
    let mut count: Option<usize> = None;
    for governed in fields {
        if !matches!(&governed.array, ArrayMode::CountedBy(c) if c == name) {
            continue;
        }
        let len = array_len(record, governed)?;
        match count {
            None => count = Some(len),
            Some(existing) if existing == len => {}
            Some(_) => {
                return Err(CodecError::InconsistentCount {
                    count: name.clone(),
                })
            }
        }
    }
    Ok(count.map(|c| c as u64))
}

fn array_len(record: &Record, field: &FieldLayout) -> CodecResult<usize> {
    match record.get(&field.name) {
        None => Ok(0),
        Some(value) => value.len().ok_or_else(|| CodecError::TypeMismatch {
            field: field.name.clone(),
            expected: "an array value",
        }),
    }
}

fn element_list<'a>(record: &'a Record, field: &FieldLayout) -> CodecResult<&'a [Value]> {
    match record.get(&field.name) {
        None => Ok(&[]),
        Some(Value::List(elements)) => Ok(elements),
        Some(_) => Err(CodecError::TypeMismatch {
            field: field.name.clone(),
            expected: "a list value",
        }),
    }
}

fn required<'a>(record: &'a Record, field: &str) -> CodecResult<&'a Value> {
    record.get(field).ok_or_else(|| CodecError::MissingField {
        field: field.to_string(),
    })
}

fn put_scalar(
    buf: &mut BytesMut,
    kind: ScalarKind,
    value: &Value,
    field: &str,
) -> CodecResult<()> {
    match kind {
        ScalarKind::U8 | ScalarKind::U16 | ScalarKind::U32 | ScalarKind::U64 => {
            let v = value.as_u64().ok_or_else(|| CodecError::TypeMismatch {
                field: field.to_string(),
                expected: "an unsigned integer",
            })?;
            put_unsigned(buf, kind, v, field)?;
        }
        ScalarKind::I8 | ScalarKind::I16 | ScalarKind::I32 | ScalarKind::I64 => {
            let v = value.as_i64().ok_or_else(|| CodecError::TypeMismatch {
                field: field.to_string(),
                expected: "a signed integer",
            })?;
            let width = kind.width();
            if width < 8 {
                let max = (1i64 << (width * 8 - 1)) - 1;
                let min = -(1i64 << (width * 8 - 1));
                if v < min || v > max {
                    return Err(CodecError::ValueOutOfRange {
                        field: field.to_string(),
                        width,
                    });
                }
            }
            buf.put_int(v, width);
        }
        ScalarKind::F64 => match value {
            Value::F64(v) => buf.put_f64(*v),
            _ => {
                return Err(CodecError::TypeMismatch {
                    field: field.to_string(),
                    expected: "a float value",
                })
            }
        },
    }
    Ok(())
}

fn put_unsigned(buf: &mut BytesMut, kind: ScalarKind, v: u64, field: &str) -> CodecResult<()> {
    let width = kind.width();
    if width < 8 && v >= 1u64 << (width * 8) {
        return Err(CodecError::ValueOutOfRange {
            field: field.to_string(),
            width,
        });
    }
    if !kind.is_unsigned() {
        return Err(CodecError::TypeMismatch {
            field: field.to_string(),
            expected: "an unsigned count field",
        });
    }
    buf.put_uint(v, width);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &str) -> CodecResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(CodecError::Malformed {
                field: field.to_string(),
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

fn decode_fields(reader: &mut Reader<'_>, fields: &[FieldLayout]) -> CodecResult<Record> {
    let mut record = Record::new();
    for field in fields {
        let value = match (&field.kind, &field.array) {
            (FieldKind::Scalar(kind), ArrayMode::None) => {
                get_scalar(reader, *kind, &field.name)?
            }
            (FieldKind::Struct(layout), ArrayMode::None) => {
                Value::Struct(decode_fields(reader, &layout.fields)?)
            }
            (FieldKind::Scalar(ScalarKind::U8), ArrayMode::Fixed(width)) => {
                Value::Bytes(reader.take(*width, &field.name)?.to_vec())
            }
            (FieldKind::Scalar(kind), ArrayMode::Fixed(width)) => {
                let mut elements = Vec::with_capacity(*width);
                for _ in 0..*width {
                    elements.push(get_scalar(reader, *kind, &field.name)?);
                }
                Value::List(elements)
            }
            (FieldKind::Struct(layout), ArrayMode::Fixed(width)) => {
                let mut elements = Vec::with_capacity(*width);
                for _ in 0..*width {
                    elements.push(Value::Struct(decode_fields(reader, &layout.fields)?));
                }
                Value::List(elements)
            }
            (kind, ArrayMode::CountedBy(count_field)) => {
                let count = record
                    .get(count_field)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CodecError::MissingField {
                        field: count_field.clone(),
                    })? as usize;
                match kind {
                    FieldKind::Scalar(ScalarKind::U8) => {
                        Value::Bytes(reader.take(count, &field.name)?.to_vec())
                    }
                    FieldKind::Scalar(kind) => {
                        let needed = count.checked_mul(kind.width()).unwrap_or(usize::MAX);
                        if reader.remaining() < needed {
                            return Err(CodecError::Malformed {
                                field: field.name.clone(),
                                needed,
                                remaining: reader.remaining(),
                            });
                        }
                        let mut elements = Vec::with_capacity(count);
                        for _ in 0..count {
                            elements.push(get_scalar(reader, *kind, &field.name)?);
                        }
                        Value::List(elements)
                    }
                    FieldKind::Struct(layout) => {
                        // Struct elements occupy at least one byte, so
                        // the claimed count can never exceed the
                        // remaining payload
                        if reader.remaining() < count {
                            return Err(CodecError::Malformed {
                                field: field.name.clone(),
                                needed: count,
                                remaining: reader.remaining(),
                            });
                        }
                        let mut elements = Vec::with_capacity(count);
                        for _ in 0..count {
                            elements.push(Value::Struct(decode_fields(reader, &layout.fields)?));
                        }
                        Value::List(elements)
                    }
                }
            }
        };
        record.set(field.name.clone(), value);
    }
    Ok(record)
}

fn get_scalar(reader: &mut Reader<'_>, kind: ScalarKind, field: &str) -> CodecResult<Value> {
    let chunk = reader.take(kind.width(), field)?;
    let raw = chunk
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    Ok(match kind {
        ScalarKind::U8 => Value::U8(raw as u8),
        ScalarKind::U16 => Value::U16(raw as u16),
        ScalarKind::U32 => Value::U32(raw as u32),
        ScalarKind::U64 => Value::U64(raw),
        ScalarKind::I8 => Value::I8(raw as u8 as i8),
        ScalarKind::I16 => Value::I16(raw as u16 as i16),
        ScalarKind::I32 => Value::I32(raw as u32 as i32),
        ScalarKind::I64 => Value::I64(raw as i64),
        ScalarKind::F64 => Value::F64(f64::from_bits(raw)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldLayout, MessageKind, StructLayout};
    use std::sync::Arc;

    fn create_schema() -> MessageSchema {
        MessageSchema::new(
            "memif_create",
            MessageKind::Request,
            vec![
                FieldLayout::scalar("role", ScalarKind::U8),
                FieldLayout::scalar("id", ScalarKind::U32),
                FieldLayout::bytes("secret", 8),
                FieldLayout::scalar("buffer_size", ScalarKind::U16),
            ],
        )
        .unwrap()
    }

    fn lease_schema() -> MessageSchema {
        let server = Arc::new(
            StructLayout::new(
                "domain_server",
                vec![FieldLayout::bytes("address", 4)],
            )
            .unwrap(),
        );
        MessageSchema::new(
            "lease_details",
            MessageKind::Reply,
            vec![
                FieldLayout::scalar("retval", ScalarKind::I32),
                FieldLayout::scalar("count", ScalarKind::U8),
                FieldLayout::counted_nested("servers", server, "count"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_scalar_wire_layout_is_big_endian() {
        let schema = create_schema();
        let record = Record::new()
            .with("role", Value::U8(1))
            .with("id", Value::U32(0x0102_0304))
            .with("secret", Value::Bytes(b"ab".to_vec()))
            .with("buffer_size", Value::U16(0x1122));

        let bytes = encode(&record, &schema).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[
                0x01, // role
                0x01, 0x02, 0x03, 0x04, // id, big-endian
                b'a', b'b', 0, 0, 0, 0, 0, 0, // secret, zero-padded to 8
                0x11, 0x22, // buffer_size
            ]
        );
    }

    #[test]
    fn test_roundtrip() {
        let schema = create_schema();
        let record = Record::new()
            .with("role", Value::U8(1))
            .with("id", Value::U32(42))
            .with("secret", Value::Bytes(vec![9, 8, 7, 6, 5, 4, 3, 2]))
            .with("buffer_size", Value::U16(2048));

        let bytes = encode(&record, &schema).unwrap();
        let decoded = decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_fixed_array_truncates_long_input() {
        let schema = create_schema();
        let record = Record::new()
            .with("role", Value::U8(0))
            .with("id", Value::U32(0))
            .with("secret", Value::Bytes(b"0123456789abcdef".to_vec()))
            .with("buffer_size", Value::U16(0));

        let bytes = encode(&record, &schema).unwrap();
        // 1 + 4 + 8 + 2: exactly the declared widths, data beyond the
        // eighth secret byte silently discarded
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[5..13], b"01234567");
    }

    #[test]
    fn test_fixed_array_pads_short_input() {
        let schema = create_schema();
        let record = Record::zeroed(&schema.fields);
        let bytes = encode(&record, &schema).unwrap();
        assert_eq!(bytes.len(), 15);
        assert!(bytes[5..13].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_counted_array_count_is_derived_not_trusted() {
        let schema = lease_schema();
        // Caller claims 99 servers but supplies two
        let record = Record::new()
            .with("retval", Value::I32(0))
            .with("count", Value::U8(99))
            .with(
                "servers",
                Value::List(vec![
                    Value::Struct(Record::new().with("address", Value::Bytes(vec![10, 0, 0, 1]))),
                    Value::Struct(Record::new().with("address", Value::Bytes(vec![10, 0, 0, 2]))),
                ]),
            );

        let bytes = encode(&record, &schema).unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 2 * 4);
        assert_eq!(bytes[4], 2); // written count matches the elements

        let decoded = decode(&bytes, &schema).unwrap();
        assert_eq!(decoded.get("count"), Some(&Value::U8(2)));
        assert_eq!(decoded.get("servers").and_then(Value::len), Some(2));
    }

    #[test]
    fn test_counted_array_roundtrip_with_nested_structs() {
        let schema = lease_schema();
        let record = Record::new()
            .with("retval", Value::I32(0))
            .with("count", Value::U8(1))
            .with(
                "servers",
                Value::List(vec![Value::Struct(
                    Record::new().with("address", Value::Bytes(vec![192, 168, 1, 1])),
                )]),
            );
        let bytes = encode(&record, &schema).unwrap();
        assert_eq!(decode(&bytes, &schema).unwrap(), record);
    }

    #[test]
    fn test_struct_count_exceeding_payload_is_malformed() {
        let neighbor = Arc::new(
            StructLayout::new(
                "neighbor",
                vec![FieldLayout::scalar("sw_if_index", ScalarKind::U16)],
            )
            .unwrap(),
        );
        let schema = MessageSchema::new(
            "neighbor_details",
            MessageKind::Reply,
            vec![
                FieldLayout::scalar("count", ScalarKind::U32),
                FieldLayout::counted_nested("neighbors", neighbor, "count"),
            ],
        )
        .unwrap();

        // Count claims a million elements, payload ends after the count
        let wire = 1_000_000u32.to_be_bytes();
        let result = decode(&wire, &schema);
        assert!(matches!(
            result,
            Err(CodecError::Malformed { field, needed, remaining: 0 })
                if field == "neighbors" && needed == 1_000_000
        ));
    }

    #[test]
    fn test_empty_message_encodes_to_zero_bytes() {
        let schema = MessageSchema::new("intf_dump", MessageKind::Request, vec![]).unwrap();
        let bytes = encode(&Record::new(), &schema).unwrap();
        assert!(bytes.is_empty());
        assert!(decode(&bytes, &schema).unwrap().is_empty());
    }

    #[test]
    fn test_decode_short_buffer_is_malformed() {
        let schema = create_schema();
        let result = decode(&[0x01, 0x00], &schema);
        assert!(matches!(
            result,
            Err(CodecError::Malformed { field, .. }) if field == "id"
        ));
    }

    #[test]
    fn test_decode_count_exceeding_remaining_is_malformed() {
        let schema = MessageSchema::new(
            "indices",
            MessageKind::Reply,
            vec![
                FieldLayout::scalar("count", ScalarKind::U8),
                FieldLayout::counted("sw_if_indices", ScalarKind::U32, "count"),
            ],
        )
        .unwrap();

        // Count says 5 elements (20 bytes) but only 4 bytes follow
        let result = decode(&[5, 0, 0, 0, 1], &schema);
        assert!(matches!(
            result,
            Err(CodecError::Malformed { needed: 20, remaining: 4, .. })
        ));
    }

    #[test]
    fn test_encode_value_out_of_range() {
        let schema = create_schema();
        let record = Record::zeroed(&schema.fields);
        let record = record.with("role", Value::U16(300));
        let result = encode(&record, &schema);
        assert!(matches!(
            result,
            Err(CodecError::ValueOutOfRange { field, width: 1 }) if field == "role"
        ));
    }

    #[test]
    fn test_encode_missing_scalar_field() {
        let schema = create_schema();
        let result = encode(&Record::new(), &schema);
        assert!(matches!(result, Err(CodecError::MissingField { .. })));
    }

    #[test]
    fn test_inconsistent_shared_count_rejected() {
        let schema = MessageSchema::new(
            "pairs",
            MessageKind::Request,
            vec![
                FieldLayout::scalar("count", ScalarKind::U8),
                FieldLayout::counted("left", ScalarKind::U16, "count"),
                FieldLayout::counted("right", ScalarKind::U16, "count"),
            ],
        )
        .unwrap();

        let record = Record::new()
            .with("left", Value::List(vec![Value::U16(1)]))
            .with("right", Value::List(vec![Value::U16(1), Value::U16(2)]));
        assert!(matches!(
            encode(&record, &schema),
            Err(CodecError::InconsistentCount { count }) if count == "count"
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let schema = MessageSchema::new(
            "ack",
            MessageKind::Reply,
            vec![FieldLayout::scalar("retval", ScalarKind::I32)],
        )
        .unwrap();
        let decoded = decode(&[0xff, 0xff, 0xff, 0xfd, 0xaa, 0xbb], &schema).unwrap();
        assert_eq!(decoded.get("retval"), Some(&Value::I32(-3)));
    }

    #[test]
    fn test_signed_scalar_roundtrip() {
        let schema = MessageSchema::new(
            "stats",
            MessageKind::Reply,
            vec![
                FieldLayout::scalar("delta", ScalarKind::I16),
                FieldLayout::scalar("load", ScalarKind::F64),
            ],
        )
        .unwrap();
        let record = Record::new()
            .with("delta", Value::I16(-12000))
            .with("load", Value::F64(0.625));
        let bytes = encode(&record, &schema).unwrap();
        assert_eq!(decode(&bytes, &schema).unwrap(), record);
    }

    #[test]
    fn test_fixed_struct_array_padding() {
        let point = Arc::new(
            StructLayout::new(
                "point",
                vec![
                    FieldLayout::scalar("x", ScalarKind::U16),
                    FieldLayout::scalar("y", ScalarKind::U16),
                ],
            )
            .unwrap(),
        );
        let schema = MessageSchema::new(
            "route",
            MessageKind::Request,
            vec![FieldLayout {
                name: "hops".to_string(),
                kind: FieldKind::Struct(point),
                array: ArrayMode::Fixed(3),
            }],
        )
        .unwrap();

        let record = Record::new().with(
            "hops",
            Value::List(vec![Value::Struct(
                Record::new()
                    .with("x", Value::U16(7))
                    .with("y", Value::U16(9)),
            )]),
        );
        let bytes = encode(&record, &schema).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0, 7, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0] // one hop, two zero hops
        );
    }
}
