//! Wire header
//!
//! Every UDP packet starts with a fixed 16-byte header:
//!
//! ```text
//! byte 0        version (high 4 bits) | type (low 4 bits)
//! byte 1        subtype
//! bytes 2..4    reserved, zero on send
//! bytes 4..8    remote index, u32 big-endian
//! bytes 8..16   counter, u64 big-endian
//! ```
//!
//! For encrypted message packets the header doubles as the AEAD
//! associated data, so any header tampering fails authentication.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 16;

/// Packet type identifier, low nibble of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Handshake stage message
    Handshake = 0,

    /// Encrypted overlay traffic
    Message = 1,

    /// Lighthouse query / reply / update
    Lighthouse = 2,

    /// Liveness probe
    Test = 3,

    /// Explicit tunnel teardown
    CloseTunnel = 4,

    /// "I do not know your index" notification
    RecvError = 5,

    /// Relayed data frame, payload opaque to the relay
    Relay = 6,

    /// Relay establishment control message
    RelayControl = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, NetworkError> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Message),
            2 => Ok(Self::Lighthouse),
            3 => Ok(Self::Test),
            4 => Ok(Self::CloseTunnel),
            5 => Ok(Self::RecvError),
            6 => Ok(Self::Relay),
            7 => Ok(Self::RelayControl),
            _ => Err(NetworkError::InvalidPacket(format!(
                "unknown packet type: {value}"
            ))),
        }
    }
}

/// Test packet subtypes
pub const TEST_SUBTYPE_REQUEST: u8 = 0;
pub const TEST_SUBTYPE_REPLY: u8 = 1;

/// Handshake packet subtypes
pub const HANDSHAKE_SUBTYPE_STAGE1: u8 = 1;
pub const HANDSHAKE_SUBTYPE_STAGE2: u8 = 2;

/// Parsed 16-byte wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub packet_type: PacketType,
    pub subtype: u8,
    pub remote_index: u32,
    pub counter: u64,
}

impl Header {
    pub fn new(packet_type: PacketType, subtype: u8, remote_index: u32, counter: u64) -> Self {
        Self {
            version: WIRE_VERSION,
            packet_type,
            subtype,
            remote_index,
            counter,
        }
    }

    /// Serialize into the fixed 16-byte layout
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u8((self.version << 4) | (self.packet_type as u8 & 0x0F));
        buf.put_u8(self.subtype);
        buf.put_u16(0); // reserved
        buf.put_u32(self.remote_index);
        buf.put_u64(self.counter);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse the leading header of a received datagram
    pub fn parse(mut bytes: &[u8]) -> NetworkResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "packet too short: {} bytes",
                bytes.len()
            )));
        }

        let first = bytes.get_u8();
        let version = first >> 4;
        if version != WIRE_VERSION {
            return Err(NetworkError::InvalidPacket(format!(
                "unsupported wire version: {version}"
            )));
        }
        let packet_type = PacketType::try_from(first & 0x0F)?;
        let subtype = bytes.get_u8();
        let _reserved = bytes.get_u16();
        let remote_index = bytes.get_u32();
        let counter = bytes.get_u64();

        Ok(Self {
            version,
            packet_type,
            subtype,
            remote_index,
            counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::new(PacketType::Message, 0, 0xDEADBEEF, 0x0102030405060708);
        let bytes = header.encode();
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let header = Header::new(PacketType::Test, TEST_SUBTYPE_REPLY, 0x00C0FFEE, 7);
        let bytes = header.encode();
        assert_eq!(
            bytes,
            [
                0x13, // version 1, type 3 (test)
                0x01, // subtype: reply
                0x00, 0x00, // reserved
                0x00, 0xC0, 0xFF, 0xEE, // remote index BE
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, // counter BE
            ]
        );
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(matches!(
            Header::parse(&[0x10, 0x00, 0x00]),
            Err(NetworkError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = Header::new(PacketType::Message, 0, 1, 1).encode();
        bytes[0] = 0x1F; // version 1, type 15
        assert!(matches!(
            Header::parse(&bytes),
            Err(NetworkError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut bytes = Header::new(PacketType::Message, 0, 1, 1).encode();
        bytes[0] = 0x21; // version 2
        assert!(matches!(
            Header::parse(&bytes),
            Err(NetworkError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_all_types_roundtrip() {
        for t in [
            PacketType::Handshake,
            PacketType::Message,
            PacketType::Lighthouse,
            PacketType::Test,
            PacketType::CloseTunnel,
            PacketType::RecvError,
            PacketType::Relay,
            PacketType::RelayControl,
        ] {
            let parsed = Header::parse(&Header::new(t, 0, 9, 9).encode()).unwrap();
            assert_eq!(parsed.packet_type, t);
        }
    }
}
