//! Streaming TLV writer.
//!
//! Integers are encoded at the minimal width that fits the value, which is
//! what every Matter encoder on the wire does. Container balance is checked
//! at `finish()`.

use crate::{ContainerKind, Tag, TlvError, elem, tagctl};

#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
    open: Vec<ContainerKind>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        TlvWriter {
            buf: Vec::with_capacity(cap),
            open: Vec::new(),
        }
    }

    /// Bytes written so far. Valid even with containers still open; used by
    /// chunking code to measure would-be fragment sizes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn control(&mut self, tag: Tag, elem_type: u8) {
        match tag {
            Tag::Anonymous => self.buf.push(tagctl::ANONYMOUS | elem_type),
            Tag::Context(n) => {
                self.buf.push(tagctl::CONTEXT | elem_type);
                self.buf.push(n);
            }
        }
    }

    pub fn put_unsigned(&mut self, tag: Tag, v: u64) -> Result<&mut Self, TlvError> {
        if v <= u64::from(u8::MAX) {
            self.control(tag, elem::U8);
            self.buf.push(v as u8);
        } else if v <= u64::from(u16::MAX) {
            self.control(tag, elem::U16);
            self.buf.extend_from_slice(&(v as u16).to_le_bytes());
        } else if v <= u64::from(u32::MAX) {
            self.control(tag, elem::U32);
            self.buf.extend_from_slice(&(v as u32).to_le_bytes());
        } else {
            self.control(tag, elem::U64);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(self)
    }

    pub fn put_signed(&mut self, tag: Tag, v: i64) -> Result<&mut Self, TlvError> {
        if let Ok(b) = i8::try_from(v) {
            self.control(tag, elem::I8);
            self.buf.extend_from_slice(&b.to_le_bytes());
        } else if let Ok(s) = i16::try_from(v) {
            self.control(tag, elem::I16);
            self.buf.extend_from_slice(&s.to_le_bytes());
        } else if let Ok(w) = i32::try_from(v) {
            self.control(tag, elem::I32);
            self.buf.extend_from_slice(&w.to_le_bytes());
        } else {
            self.control(tag, elem::I64);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(self)
    }

    pub fn put_bool(&mut self, tag: Tag, v: bool) -> Result<&mut Self, TlvError> {
        self.control(tag, if v { elem::TRUE } else { elem::FALSE });
        Ok(self)
    }

    pub fn put_f32(&mut self, tag: Tag, v: f32) -> Result<&mut Self, TlvError> {
        self.control(tag, elem::F32);
        self.buf.extend_from_slice(&v.to_le_bytes());
        Ok(self)
    }

    pub fn put_f64(&mut self, tag: Tag, v: f64) -> Result<&mut Self, TlvError> {
        self.control(tag, elem::F64);
        self.buf.extend_from_slice(&v.to_le_bytes());
        Ok(self)
    }

    pub fn put_utf8(&mut self, tag: Tag, v: &str) -> Result<&mut Self, TlvError> {
        self.put_with_length(tag, elem::UTF8_1, v.as_bytes())
    }

    pub fn put_bytes(&mut self, tag: Tag, v: &[u8]) -> Result<&mut Self, TlvError> {
        self.put_with_length(tag, elem::BYTES_1, v)
    }

    // `base` is the 1-byte-length element type; the 2-byte form is base+1.
    fn put_with_length(&mut self, tag: Tag, base: u8, v: &[u8]) -> Result<&mut Self, TlvError> {
        if let Ok(len) = u8::try_from(v.len()) {
            self.control(tag, base);
            self.buf.push(len);
        } else if let Ok(len) = u16::try_from(v.len()) {
            self.control(tag, base + 1);
            self.buf.extend_from_slice(&len.to_le_bytes());
        } else {
            // IM payloads are bounded well below 64 KiB per element.
            return Err(TlvError::LengthOverrun(v.len() as u64));
        }
        self.buf.extend_from_slice(v);
        Ok(self)
    }

    pub fn put_null(&mut self, tag: Tag) -> Result<&mut Self, TlvError> {
        self.control(tag, elem::NULL);
        Ok(self)
    }

    pub fn start_structure(&mut self, tag: Tag) -> Result<&mut Self, TlvError> {
        self.start(tag, ContainerKind::Structure)
    }

    pub fn start_array(&mut self, tag: Tag) -> Result<&mut Self, TlvError> {
        self.start(tag, ContainerKind::Array)
    }

    pub fn start_list(&mut self, tag: Tag) -> Result<&mut Self, TlvError> {
        self.start(tag, ContainerKind::List)
    }

    fn start(&mut self, tag: Tag, kind: ContainerKind) -> Result<&mut Self, TlvError> {
        if self.open.len() >= crate::MAX_DEPTH {
            return Err(TlvError::DepthExceeded);
        }
        let elem_type = match kind {
            ContainerKind::Structure => elem::STRUCTURE,
            ContainerKind::Array => elem::ARRAY,
            ContainerKind::List => elem::LIST,
        };
        self.control(tag, elem_type);
        self.open.push(kind);
        Ok(self)
    }

    pub fn end_container(&mut self) -> Result<&mut Self, TlvError> {
        self.open.pop().ok_or(TlvError::ContainerMismatch)?;
        self.buf.push(elem::END_CONTAINER);
        Ok(self)
    }

    /// Append pre-encoded TLV verbatim. The fragment must be a balanced
    /// element sequence; chunking code uses this to splice measured IBs.
    pub fn put_raw(&mut self, fragment: &[u8]) -> Result<&mut Self, TlvError> {
        self.buf.extend_from_slice(fragment);
        Ok(self)
    }

    pub fn finish(self) -> Result<Vec<u8>, TlvError> {
        if self.open.is_empty() {
            Ok(self.buf)
        } else {
            Err(TlvError::ContainerMismatch)
        }
    }
}
