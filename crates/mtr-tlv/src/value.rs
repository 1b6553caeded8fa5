//! Owned TLV value tree.
//!
//! Attribute data and command fields are free-form TLV; this is their
//! canonical in-memory form. Encoding picks minimal widths, so a decoded
//! value re-encodes to the same bytes the peer sent when the peer also used
//! minimal widths (all known stacks do).

use crate::{ContainerKind, Element, ElementValue, Tag, TlvError, TlvReader, TlvWriter};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Bool(bool),
    F64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    Null,
    Structure(Vec<(Tag, Value)>),
    Array(Vec<Value>),
    List(Vec<(Tag, Value)>),
}

impl Value {
    /// Encode this value under `tag`.
    pub fn encode(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        match self {
            Value::Signed(v) => {
                w.put_signed(tag, *v)?;
            }
            Value::Unsigned(v) => {
                w.put_unsigned(tag, *v)?;
            }
            Value::Bool(v) => {
                w.put_bool(tag, *v)?;
            }
            Value::F64(v) => {
                w.put_f64(tag, *v)?;
            }
            Value::Utf8(v) => {
                w.put_utf8(tag, v)?;
            }
            Value::Bytes(v) => {
                w.put_bytes(tag, v)?;
            }
            Value::Null => {
                w.put_null(tag)?;
            }
            Value::Structure(fields) => {
                w.start_structure(tag)?;
                for (t, v) in fields {
                    v.encode(w, *t)?;
                }
                w.end_container()?;
            }
            Value::Array(items) => {
                w.start_array(tag)?;
                for v in items {
                    v.encode(w, Tag::Anonymous)?;
                }
                w.end_container()?;
            }
            Value::List(items) => {
                w.start_list(tag)?;
                for (t, v) in items {
                    v.encode(w, *t)?;
                }
                w.end_container()?;
            }
        }
        Ok(())
    }

    /// Encode as a standalone anonymous element.
    pub fn to_tlv(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        self.encode(&mut w, Tag::Anonymous)?;
        w.finish()
    }

    /// Build a value from the element the reader just produced, consuming
    /// container contents from the reader as needed.
    pub fn decode(element: &Element<'_>, r: &mut TlvReader<'_>) -> Result<Value, TlvError> {
        Self::decode_at_depth(element, r, 0)
    }

    fn decode_at_depth(
        element: &Element<'_>,
        r: &mut TlvReader<'_>,
        depth: usize,
    ) -> Result<Value, TlvError> {
        if depth > crate::MAX_DEPTH {
            return Err(TlvError::DepthExceeded);
        }
        let value = match &element.value {
            ElementValue::Signed(v) => Value::Signed(*v),
            ElementValue::Unsigned(v) => Value::Unsigned(*v),
            ElementValue::Bool(v) => Value::Bool(*v),
            ElementValue::F32(v) => Value::F64(f64::from(*v)),
            ElementValue::F64(v) => Value::F64(*v),
            ElementValue::Utf8(v) => Value::Utf8((*v).to_owned()),
            ElementValue::Bytes(v) => Value::Bytes(v.to_vec()),
            ElementValue::Null => Value::Null,
            ElementValue::ContainerEnd => return Err(TlvError::ContainerMismatch),
            ElementValue::ContainerStart(kind) => {
                let mut tagged = Vec::new();
                let mut items = Vec::new();
                loop {
                    let inner = r.next()?.ok_or(TlvError::UnexpectedEnd)?;
                    if inner.value == ElementValue::ContainerEnd {
                        break;
                    }
                    let v = Self::decode_at_depth(&inner, r, depth + 1)?;
                    match kind {
                        ContainerKind::Array => items.push(v),
                        _ => tagged.push((inner.tag, v)),
                    }
                }
                match kind {
                    ContainerKind::Structure => Value::Structure(tagged),
                    ContainerKind::Array => Value::Array(items),
                    ContainerKind::List => Value::List(tagged),
                }
            }
        };
        Ok(value)
    }

    /// Parse a standalone anonymous element.
    pub fn from_tlv(buf: &[u8]) -> Result<Value, TlvError> {
        let mut r = TlvReader::new(buf);
        let element = r.next()?.ok_or(TlvError::UnexpectedEnd)?;
        Self::decode(&element, &mut r)
    }
}
