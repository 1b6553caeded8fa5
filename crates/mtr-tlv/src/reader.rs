//! Pull-based TLV reader.
//!
//! `next()` yields one element at a time; container starts and ends appear
//! as their own elements. Callers walking a structure match on context tag
//! numbers and use `skip_value` for anything they do not understand.

use crate::{ContainerKind, Tag, TlvError, elem, tagctl};

#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue<'a> {
    Signed(i64),
    Unsigned(u64),
    Bool(bool),
    F32(f32),
    F64(f64),
    Utf8(&'a str),
    Bytes(&'a [u8]),
    Null,
    ContainerStart(ContainerKind),
    ContainerEnd,
}

impl ElementValue<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            ElementValue::Signed(_) => "signed integer",
            ElementValue::Unsigned(_) => "unsigned integer",
            ElementValue::Bool(_) => "boolean",
            ElementValue::F32(_) | ElementValue::F64(_) => "float",
            ElementValue::Utf8(_) => "utf8 string",
            ElementValue::Bytes(_) => "octet string",
            ElementValue::Null => "null",
            ElementValue::ContainerStart(_) => "container",
            ElementValue::ContainerEnd => "end of container",
        }
    }

    pub fn as_unsigned(&self) -> Result<u64, TlvError> {
        match *self {
            ElementValue::Unsigned(v) => Ok(v),
            ref other => Err(TlvError::TypeMismatch {
                expected: "unsigned integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_signed(&self) -> Result<i64, TlvError> {
        match *self {
            ElementValue::Signed(v) => Ok(v),
            // Accept unsigned where a signed value is expected, as long as it fits.
            ElementValue::Unsigned(v) => {
                i64::try_from(v).map_err(|_| TlvError::TypeMismatch {
                    expected: "signed integer",
                    found: "unsigned integer",
                })
            }
            ref other => Err(TlvError::TypeMismatch {
                expected: "signed integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_bool(&self) -> Result<bool, TlvError> {
        match *self {
            ElementValue::Bool(v) => Ok(v),
            ref other => Err(TlvError::TypeMismatch {
                expected: "boolean",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_utf8(&self) -> Result<&str, TlvError> {
        match *self {
            ElementValue::Utf8(v) => Ok(v),
            ref other => Err(TlvError::TypeMismatch {
                expected: "utf8 string",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], TlvError> {
        match *self {
            ElementValue::Bytes(v) => Ok(v),
            ref other => Err(TlvError::TypeMismatch {
                expected: "octet string",
                found: other.type_name(),
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ElementValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element<'a> {
    pub tag: Tag,
    pub value: ElementValue<'a>,
}

#[derive(Debug)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TlvReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TlvError> {
        if self.remaining() < n {
            return Err(TlvError::UnexpectedEnd);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, TlvError> {
        Ok(self.take(1)?[0])
    }

    fn take_le(&mut self, width: usize) -> Result<u64, TlvError> {
        let bytes = self.take(width)?;
        let mut v = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            v |= u64::from(*b) << (8 * i);
        }
        Ok(v)
    }

    fn take_length(&mut self, width: usize) -> Result<usize, TlvError> {
        let len = self.take_le(width)?;
        usize::try_from(len)
            .ok()
            .filter(|l| *l <= self.remaining())
            .ok_or(TlvError::LengthOverrun(len))
    }

    /// Read the next element, or `None` at end of input.
    pub fn next(&mut self) -> Result<Option<Element<'a>>, TlvError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let control = self.take_u8()?;
        let elem_type = control & 0x1f;
        let tag_control = control & 0xe0;

        // END_CONTAINER never carries a tag.
        if elem_type == elem::END_CONTAINER {
            if tag_control != tagctl::ANONYMOUS {
                return Err(TlvError::UnsupportedTagControl(tag_control));
            }
            return Ok(Some(Element {
                tag: Tag::Anonymous,
                value: ElementValue::ContainerEnd,
            }));
        }

        let tag = match tag_control {
            tagctl::ANONYMOUS => Tag::Anonymous,
            tagctl::CONTEXT => Tag::Context(self.take_u8()?),
            other => return Err(TlvError::UnsupportedTagControl(other)),
        };

        let value = match elem_type {
            elem::I8 => ElementValue::Signed(i64::from(self.take_u8()? as i8)),
            elem::I16 => ElementValue::Signed(i64::from(self.take_le(2)? as u16 as i16)),
            elem::I32 => ElementValue::Signed(i64::from(self.take_le(4)? as u32 as i32)),
            elem::I64 => ElementValue::Signed(self.take_le(8)? as i64),
            elem::U8 => ElementValue::Unsigned(self.take_le(1)?),
            elem::U16 => ElementValue::Unsigned(self.take_le(2)?),
            elem::U32 => ElementValue::Unsigned(self.take_le(4)?),
            elem::U64 => ElementValue::Unsigned(self.take_le(8)?),
            elem::FALSE => ElementValue::Bool(false),
            elem::TRUE => ElementValue::Bool(true),
            elem::F32 => {
                let raw = self.take_le(4)? as u32;
                ElementValue::F32(f32::from_le_bytes(raw.to_le_bytes()))
            }
            elem::F64 => {
                let raw = self.take_le(8)?;
                ElementValue::F64(f64::from_le_bytes(raw.to_le_bytes()))
            }
            elem::UTF8_1 | elem::UTF8_2 | elem::UTF8_4 | elem::UTF8_8 => {
                let width = 1usize << (elem_type - elem::UTF8_1);
                let len = self.take_length(width)?;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| TlvError::InvalidUtf8)?;
                ElementValue::Utf8(s)
            }
            elem::BYTES_1 | elem::BYTES_2 | elem::BYTES_4 | elem::BYTES_8 => {
                let width = 1usize << (elem_type - elem::BYTES_1);
                let len = self.take_length(width)?;
                ElementValue::Bytes(self.take(len)?)
            }
            elem::NULL => ElementValue::Null,
            elem::STRUCTURE => ElementValue::ContainerStart(ContainerKind::Structure),
            elem::ARRAY => ElementValue::ContainerStart(ContainerKind::Array),
            elem::LIST => ElementValue::ContainerStart(ContainerKind::List),
            other => return Err(TlvError::UnknownElementType(other)),
        };

        Ok(Some(Element { tag, value }))
    }

    /// If `element` opened a container, consume everything up to and
    /// including its end marker. For scalar elements this is a no-op (the
    /// value was consumed by `next()` already).
    pub fn skip_value(&mut self, element: &Element<'a>) -> Result<(), TlvError> {
        if !matches!(element.value, ElementValue::ContainerStart(_)) {
            return Ok(());
        }
        let mut depth = 1usize;
        while depth > 0 {
            let inner = self.next()?.ok_or(TlvError::UnexpectedEnd)?;
            match inner.value {
                ElementValue::ContainerStart(_) => {
                    depth += 1;
                    if depth > crate::MAX_DEPTH {
                        return Err(TlvError::DepthExceeded);
                    }
                }
                ElementValue::ContainerEnd => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Consume elements until the current container's end marker.
    pub fn exit_container(&mut self) -> Result<(), TlvError> {
        let mut depth = 1usize;
        while depth > 0 {
            let inner = self.next()?.ok_or(TlvError::UnexpectedEnd)?;
            match inner.value {
                ElementValue::ContainerStart(_) => depth += 1,
                ElementValue::ContainerEnd => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }
}
