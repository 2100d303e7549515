//! Common header shared by every frame.
//!
//! The header is a fixed 20-byte prefix carrying routing and correlation
//! information; it is followed by the subtype-specific body and a 4-byte
//! end-marker.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Wire protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Common header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Size of the trailing end-marker in bytes.
pub const END_MARKER_SIZE: usize = 4;

/// Magic value closing every frame.
pub const END_MARKER: u32 = 0xDEAD_CAFE;

/// Message classes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Session lifecycle (handshake and teardown).
    Session = 1,
    /// Liveness probing.
    Heartbeat = 2,
    /// Error notification.
    Error = 3,
    /// Single-block data.
    DataSingle = 4,
    /// Multiblock data transfer.
    DataMulti = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(MessageType::Session),
            2 => Ok(MessageType::Heartbeat),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::DataSingle),
            5 => Ok(MessageType::DataMulti),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// The sender expects a reply and tracks this message for timeout.
        const REPLY_EXPECTED = 1 << 0;
        /// This frame is a reply to a previously received message.
        const IS_REPLY = 1 << 1;
    }
}

/// Fixed common header (20 bytes, little-endian integers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// Message class.
    pub msg_type: MessageType,
    /// Message within the class.
    pub sub_type: u8,
    /// Reply-expected / is-reply bits.
    pub flags: Flags,
    /// Protocol version, must be [`WIRE_VERSION`].
    pub version: u8,
    /// Sender-allocated id used for reply correlation.
    pub message_id: u32,
    /// Target session id, `0` before the handshake assigned one.
    pub session_id: u32,
    /// Entire frame length including header and end-marker.
    pub total_size: u32,
    /// Body bytes excluding header and end-marker.
    pub payload_size: u32,
}

impl CommonHeader {
    /// Create a header for a body of `payload_size` bytes.
    pub fn new(
        msg_type: MessageType,
        sub_type: u8,
        flags: Flags,
        message_id: u32,
        session_id: u32,
        payload_size: u32,
    ) -> Self {
        Self {
            msg_type,
            sub_type,
            flags,
            version: WIRE_VERSION,
            message_id,
            session_id,
            total_size: (HEADER_SIZE + END_MARKER_SIZE) as u32 + payload_size,
            payload_size,
        }
    }

    /// Encode the header (little-endian).
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.sub_type);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.version);
        buf.put_u32_le(self.message_id);
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(self.payload_size);
    }

    /// Decode the header from a buffer holding at least [`HEADER_SIZE`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::Malformed);
        }

        let msg_type = MessageType::try_from(buf.get_u8())?;
        let sub_type = buf.get_u8();
        let flags = Flags::from_bits(buf.get_u8()).ok_or(WireError::Malformed)?;
        let version = buf.get_u8();

        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }

        let message_id = buf.get_u32_le();
        let session_id = buf.get_u32_le();
        let total_size = buf.get_u32_le();
        let payload_size = buf.get_u32_le();

        Ok(Self {
            msg_type,
            sub_type,
            flags,
            version,
            message_id,
            session_id,
            total_size,
            payload_size,
        })
    }

    /// Validate the internal size consistency of the header.
    pub fn validate(&self) -> Result<(), WireError> {
        let expected = (HEADER_SIZE + END_MARKER_SIZE) as u64 + self.payload_size as u64;
        if self.total_size as u64 != expected {
            return Err(WireError::Size(self.total_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Session);
        assert_eq!(MessageType::try_from(5).unwrap(), MessageType::DataMulti);
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_flags() {
        let flags = Flags::REPLY_EXPECTED | Flags::IS_REPLY;
        assert!(flags.contains(Flags::REPLY_EXPECTED));
        assert!(flags.contains(Flags::IS_REPLY));
        assert!(Flags::from_bits(0x04).is_none());
    }

    #[test]
    fn test_header_encode_decode() {
        let header = CommonHeader::new(
            MessageType::DataSingle,
            2,
            Flags::REPLY_EXPECTED,
            42,
            7,
            16,
        );

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = CommonHeader::decode(&mut buf).unwrap();
        assert_eq!(header, decoded);
        decoded.validate().unwrap();
    }

    #[test]
    fn test_header_rejects_version() {
        let header = CommonHeader::new(MessageType::Heartbeat, 1, Flags::empty(), 1, 1, 0);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[3] = 9;

        assert!(matches!(
            CommonHeader::decode(&mut buf),
            Err(WireError::Version(9))
        ));
    }

    #[test]
    fn test_header_size_validation() {
        let mut header = CommonHeader::new(MessageType::Session, 1, Flags::empty(), 1, 0, 12);
        header.total_size += 1;
        assert!(matches!(header.validate(), Err(WireError::Size(_))));
    }
}
