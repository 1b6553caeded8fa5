//! Matter message headers.
//!
//! # Packet header (plaintext, also the AEAD associated data)
//! ```text
//! [message flags u8][session id u16 LE][security flags u8][counter u32 LE]
//! [source node id u64 LE?][dest node id u64 LE? | dest group id u16 LE?]
//! ```
//!
//! # Payload header (encrypted for secure sessions)
//! ```text
//! [exchange flags u8][opcode u8][exchange id u16 LE]
//! [vendor id u16 LE?][protocol id u16 LE][ack counter u32 LE?]
//! [extension len u16 LE + bytes?]
//! ```

use bytes::{Buf, BufMut};

use crate::CodecError;

// ---------------------------------------------------------------------------
// Message flags (packet header byte 0)
// ---------------------------------------------------------------------------

const FLAG_VERSION_MASK: u8 = 0xf0;
const FLAG_SOURCE_PRESENT: u8 = 0x04;
const FLAG_DSIZ_MASK: u8 = 0x03;
const DSIZ_NONE: u8 = 0x00;
const DSIZ_NODE_ID: u8 = 0x01;
const DSIZ_GROUP_ID: u8 = 0x02;

// ---------------------------------------------------------------------------
// Security flags (packet header byte 3)
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecurityFlags: u8 {
        const PRIVACY = 0x80;
        const CONTROL = 0x40;
        const MESSAGE_EXTENSIONS = 0x20;
    }
}

const SECURITY_SESSION_TYPE_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Unicast,
    Group,
}

impl SessionType {
    fn to_bits(self) -> u8 {
        match self {
            SessionType::Unicast => 0x00,
            SessionType::Group => 0x01,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0x00 => Ok(SessionType::Unicast),
            0x01 => Ok(SessionType::Group),
            other => Err(CodecError::UnsupportedSessionType(other)),
        }
    }
}

/// Destination of a packet: absent, a node id, or a group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationId {
    #[default]
    None,
    Node(u64),
    Group(u16),
}

// ---------------------------------------------------------------------------
// PacketHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub session_id: u16,
    pub session_type: SessionType,
    pub security_flags: SecurityFlags,
    pub message_counter: u32,
    pub source_node_id: Option<u64>,
    pub destination: DestinationId,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = 0u8;
        if self.source_node_id.is_some() {
            flags |= FLAG_SOURCE_PRESENT;
        }
        flags |= match self.destination {
            DestinationId::None => DSIZ_NONE,
            DestinationId::Node(_) => DSIZ_NODE_ID,
            DestinationId::Group(_) => DSIZ_GROUP_ID,
        };
        buf.put_u8(flags);
        buf.put_u16_le(self.session_id);
        buf.put_u8(self.security_flags.bits() | self.session_type.to_bits());
        buf.put_u32_le(self.message_counter);
        if let Some(src) = self.source_node_id {
            buf.put_u64_le(src);
        }
        match self.destination {
            DestinationId::None => {}
            DestinationId::Node(id) => buf.put_u64_le(id),
            DestinationId::Group(id) => buf.put_u16_le(id),
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + if self.source_node_id.is_some() { 8 } else { 0 }
            + match self.destination {
                DestinationId::None => 0,
                DestinationId::Node(_) => 8,
                DestinationId::Group(_) => 2,
            }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < 8 {
            return Err(CodecError::Truncated);
        }
        let flags = buf.get_u8();
        let version = (flags & FLAG_VERSION_MASK) >> 4;
        if version != 0 {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let session_id = buf.get_u16_le();
        let sec = buf.get_u8();
        let session_type = SessionType::from_bits(sec & SECURITY_SESSION_TYPE_MASK)?;
        let security_flags = SecurityFlags::from_bits_truncate(sec);
        let message_counter = buf.get_u32_le();

        let source_node_id = if flags & FLAG_SOURCE_PRESENT != 0 {
            if buf.remaining() < 8 {
                return Err(CodecError::Truncated);
            }
            Some(buf.get_u64_le())
        } else {
            None
        };
        let destination = match flags & FLAG_DSIZ_MASK {
            DSIZ_NONE => DestinationId::None,
            DSIZ_NODE_ID => {
                if buf.remaining() < 8 {
                    return Err(CodecError::Truncated);
                }
                DestinationId::Node(buf.get_u64_le())
            }
            DSIZ_GROUP_ID => {
                if buf.remaining() < 2 {
                    return Err(CodecError::Truncated);
                }
                DestinationId::Group(buf.get_u16_le())
            }
            _ => return Err(CodecError::UnsupportedSessionType(flags & FLAG_DSIZ_MASK)),
        };

        Ok(PacketHeader {
            session_id,
            session_type,
            security_flags,
            message_counter,
            source_node_id,
            destination,
        })
    }
}

// ---------------------------------------------------------------------------
// Exchange flags (payload header byte 0)
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExchangeFlags: u8 {
        const INITIATOR = 0x01;
        const ACK = 0x02;
        const REQUIRES_ACK = 0x04;
        const SECURED_EXTENSIONS = 0x08;
        const VENDOR = 0x10;
    }
}

// ---------------------------------------------------------------------------
// PayloadHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub is_initiator: bool,
    pub requires_ack: bool,
    pub message_type: u8,
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub vendor_id: Option<u16>,
    pub ack_message_id: Option<u32>,
}

impl PayloadHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = ExchangeFlags::empty();
        if self.is_initiator {
            flags |= ExchangeFlags::INITIATOR;
        }
        if self.requires_ack {
            flags |= ExchangeFlags::REQUIRES_ACK;
        }
        if self.ack_message_id.is_some() {
            flags |= ExchangeFlags::ACK;
        }
        if self.vendor_id.is_some() {
            flags |= ExchangeFlags::VENDOR;
        }
        buf.put_u8(flags.bits());
        buf.put_u8(self.message_type);
        buf.put_u16_le(self.exchange_id);
        if let Some(vendor) = self.vendor_id {
            buf.put_u16_le(vendor);
        }
        buf.put_u16_le(self.protocol_id);
        if let Some(ack) = self.ack_message_id {
            buf.put_u32_le(ack);
        }
    }

    pub fn encoded_len(&self) -> usize {
        6 + if self.vendor_id.is_some() { 2 } else { 0 }
            + if self.ack_message_id.is_some() { 4 } else { 0 }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < 6 {
            return Err(CodecError::Truncated);
        }
        let flags = ExchangeFlags::from_bits_truncate(buf.get_u8());
        let message_type = buf.get_u8();
        let exchange_id = buf.get_u16_le();
        let vendor_id = if flags.contains(ExchangeFlags::VENDOR) {
            if buf.remaining() < 2 {
                return Err(CodecError::Truncated);
            }
            Some(buf.get_u16_le())
        } else {
            None
        };
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated);
        }
        let protocol_id = buf.get_u16_le();
        let ack_message_id = if flags.contains(ExchangeFlags::ACK) {
            if buf.remaining() < 4 {
                return Err(CodecError::Truncated);
            }
            Some(buf.get_u32_le())
        } else {
            None
        };
        if flags.contains(ExchangeFlags::SECURED_EXTENSIONS) {
            // Parsed past, never interpreted.
            if buf.remaining() < 2 {
                return Err(CodecError::Truncated);
            }
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(CodecError::Truncated);
            }
            buf.advance(len);
        }

        Ok(PayloadHeader {
            is_initiator: flags.contains(ExchangeFlags::INITIATOR),
            requires_ack: flags.contains(ExchangeFlags::REQUIRES_ACK),
            message_type,
            exchange_id,
            protocol_id,
            vendor_id,
            ack_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_round_trips_all_destination_forms() {
        for destination in [
            DestinationId::None,
            DestinationId::Node(0x1122_3344_5566_7788),
            DestinationId::Group(0x0102),
        ] {
            let hdr = PacketHeader {
                session_id: 0xbeef,
                session_type: SessionType::Unicast,
                security_flags: SecurityFlags::empty(),
                message_counter: 7,
                source_node_id: Some(0xaabb_ccdd_0011_2233),
                destination,
            };
            let mut buf = Vec::new();
            hdr.encode(&mut buf);
            assert_eq!(buf.len(), hdr.encoded_len());
            let decoded = PacketHeader::decode(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, hdr);
        }
    }

    #[test]
    fn group_session_type_survives_round_trip() {
        let hdr = PacketHeader {
            session_id: 1,
            session_type: SessionType::Group,
            security_flags: SecurityFlags::empty(),
            message_counter: 1,
            source_node_id: None,
            destination: DestinationId::Group(7),
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let decoded = PacketHeader::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.session_type, SessionType::Group);
    }

    #[test]
    fn payload_header_round_trips_with_and_without_ack() {
        for ack in [None, Some(0xdead_beef)] {
            let hdr = PayloadHeader {
                is_initiator: true,
                requires_ack: true,
                message_type: 0x02,
                exchange_id: 0x4242,
                protocol_id: crate::PROTOCOL_ID_INTERACTION_MODEL,
                vendor_id: None,
                ack_message_id: ack,
            };
            let mut buf = Vec::new();
            hdr.encode(&mut buf);
            assert_eq!(buf.len(), hdr.encoded_len());
            let decoded = PayloadHeader::decode(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, hdr);
        }
    }

    #[test]
    fn secured_extensions_are_skipped() {
        let mut buf = Vec::new();
        buf.put_u8(
            (ExchangeFlags::INITIATOR | ExchangeFlags::SECURED_EXTENSIONS).bits(),
        );
        buf.put_u8(0x02);
        buf.put_u16_le(9);
        buf.put_u16_le(crate::PROTOCOL_ID_INTERACTION_MODEL);
        buf.put_u16_le(3); // extension length
        buf.extend_from_slice(&[1, 2, 3]);
        buf.extend_from_slice(b"payload");

        let mut slice = buf.as_slice();
        let decoded = PayloadHeader::decode(&mut slice).unwrap();
        assert_eq!(decoded.exchange_id, 9);
        assert_eq!(slice, b"payload");
    }

    #[test]
    fn truncated_headers_error() {
        assert_eq!(
            PacketHeader::decode(&mut [0u8; 4].as_slice()),
            Err(CodecError::Truncated)
        );
        assert_eq!(
            PayloadHeader::decode(&mut [0u8; 3].as_slice()),
            Err(CodecError::Truncated)
        );
    }
}
