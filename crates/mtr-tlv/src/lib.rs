// mtr-tlv: Matter TLV encoding and decoding.
//
// The subset implemented here covers everything the Interaction Model
// payloads use: anonymous and context-specific tags, integers, booleans,
// strings, octet strings, null, floats, and the three container kinds.

pub mod reader;
pub mod value;
pub mod writer;

pub use reader::{Element, ElementValue, TlvReader};
pub use value::Value;
pub use writer::TlvWriter;

/// Maximum container nesting accepted on decode.
///
/// IM payloads never nest deeper than a handful of levels; the cap bounds
/// stack usage when skipping hostile input.
pub const MAX_DEPTH: usize = 16;

/// A TLV tag.
///
/// Only anonymous and context-specific (1-byte) tags appear in IM payloads.
/// Profile-qualified tags are rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Anonymous,
    Context(u8),
}

/// The three TLV container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Structure,
    Array,
    List,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unknown element type {0:#04x}")]
    UnknownElementType(u8),
    #[error("unsupported tag control {0:#04x}")]
    UnsupportedTagControl(u8),
    #[error("container mismatch")]
    ContainerMismatch,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("missing element for tag {0:?}")]
    MissingElement(Tag),
    #[error("nesting deeper than {MAX_DEPTH}")]
    DepthExceeded,
    #[error("invalid UTF-8 in string element")]
    InvalidUtf8,
    #[error("length {0} exceeds remaining input")]
    LengthOverrun(u64),
}

// Element type constants (low 5 bits of the control byte).
pub(crate) mod elem {
    pub const I8: u8 = 0x00;
    pub const I16: u8 = 0x01;
    pub const I32: u8 = 0x02;
    pub const I64: u8 = 0x03;
    pub const U8: u8 = 0x04;
    pub const U16: u8 = 0x05;
    pub const U32: u8 = 0x06;
    pub const U64: u8 = 0x07;
    pub const FALSE: u8 = 0x08;
    pub const TRUE: u8 = 0x09;
    pub const F32: u8 = 0x0a;
    pub const F64: u8 = 0x0b;
    pub const UTF8_1: u8 = 0x0c;
    pub const UTF8_2: u8 = 0x0d;
    pub const UTF8_4: u8 = 0x0e;
    pub const UTF8_8: u8 = 0x0f;
    pub const BYTES_1: u8 = 0x10;
    pub const BYTES_2: u8 = 0x11;
    pub const BYTES_4: u8 = 0x12;
    pub const BYTES_8: u8 = 0x13;
    pub const NULL: u8 = 0x14;
    pub const STRUCTURE: u8 = 0x15;
    pub const ARRAY: u8 = 0x16;
    pub const LIST: u8 = 0x17;
    pub const END_CONTAINER: u8 = 0x18;
}

// Tag control constants (high 3 bits of the control byte).
pub(crate) mod tagctl {
    pub const ANONYMOUS: u8 = 0x00;
    pub const CONTEXT: u8 = 0x20;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars_through_a_structure() {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous).unwrap();
        w.put_unsigned(Tag::Context(0), 42).unwrap();
        w.put_signed(Tag::Context(1), -7).unwrap();
        w.put_bool(Tag::Context(2), true).unwrap();
        w.put_utf8(Tag::Context(3), "on/off").unwrap();
        w.put_bytes(Tag::Context(4), &[0xde, 0xad]).unwrap();
        w.put_null(Tag::Context(5)).unwrap();
        w.end_container().unwrap();
        let buf = w.finish().unwrap();

        let mut r = TlvReader::new(&buf);
        let root = r.next().unwrap().unwrap();
        assert_eq!(
            root.value,
            ElementValue::ContainerStart(ContainerKind::Structure)
        );

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.tag, Tag::Context(0));
        assert_eq!(e.value.as_unsigned().unwrap(), 42);

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.value.as_signed().unwrap(), -7);

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.value.as_bool().unwrap(), true);

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.value.as_utf8().unwrap(), "on/off");

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.value.as_bytes().unwrap(), &[0xde, 0xad]);

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.value, ElementValue::Null);

        let e = r.next().unwrap().unwrap();
        assert_eq!(e.value, ElementValue::ContainerEnd);
        assert!(r.next().unwrap().is_none());
    }

    #[test]
    fn integers_use_minimal_width() {
        let mut w = TlvWriter::new();
        w.put_unsigned(Tag::Anonymous, 5).unwrap();
        let buf = w.finish().unwrap();
        // control byte + single value byte
        assert_eq!(buf, vec![elem::U8, 0x05]);

        let mut w = TlvWriter::new();
        w.put_unsigned(Tag::Anonymous, 0x1_0000).unwrap();
        let buf = w.finish().unwrap();
        assert_eq!(buf[0], elem::U32);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn rejects_truncated_input() {
        let mut w = TlvWriter::new();
        w.put_utf8(Tag::Anonymous, "hello").unwrap();
        let buf = w.finish().unwrap();

        let mut r = TlvReader::new(&buf[..buf.len() - 1]);
        assert!(r.next().is_err());
    }

    #[test]
    fn unbalanced_writer_is_an_error() {
        let mut w = TlvWriter::new();
        w.start_array(Tag::Anonymous).unwrap();
        assert_eq!(w.finish().unwrap_err(), TlvError::ContainerMismatch);

        let mut w = TlvWriter::new();
        assert_eq!(w.end_container().unwrap_err(), TlvError::ContainerMismatch);
    }

    #[test]
    fn skip_value_steps_over_nested_containers() {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous).unwrap();
        w.start_array(Tag::Context(0)).unwrap();
        w.start_structure(Tag::Anonymous).unwrap();
        w.put_unsigned(Tag::Context(9), 1).unwrap();
        w.end_container().unwrap();
        w.end_container().unwrap();
        w.put_unsigned(Tag::Context(1), 2).unwrap();
        w.end_container().unwrap();
        let buf = w.finish().unwrap();

        let mut r = TlvReader::new(&buf);
        r.next().unwrap().unwrap(); // structure start
        let arr = r.next().unwrap().unwrap();
        assert_eq!(arr.tag, Tag::Context(0));
        r.skip_value(&arr).unwrap();
        let e = r.next().unwrap().unwrap();
        assert_eq!(e.tag, Tag::Context(1));
        assert_eq!(e.value.as_unsigned().unwrap(), 2);
    }
}
