//! Frame encoding and incremental decoding.
//!
//! A frame is `common header | body | end-marker`. The decoder slices
//! complete frames out of an inbound byte buffer and leaves partial frames
//! untouched until more bytes arrive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::header::{CommonHeader, Flags, END_MARKER, END_MARKER_SIZE, HEADER_SIZE};
use crate::message::Message;

/// Maximum accepted frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Common header.
    pub header: CommonHeader,
    /// Decoded sub-message.
    pub message: Message,
}

impl Frame {
    /// Build a frame around `message`, filling in the size fields.
    pub fn new(message: Message, session_id: u32, message_id: u32, flags: Flags) -> Self {
        let (msg_type, sub_type) = message.kind();
        let header = CommonHeader::new(
            msg_type,
            sub_type,
            flags,
            message_id,
            session_id,
            message.body_size() as u32,
        );
        Self { header, message }
    }

    /// Encode header, body, and end-marker into a contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.total_size as usize);
        self.header.encode(&mut buf);
        self.message.encode_body(&mut buf);
        buf.put_u32_le(END_MARKER);
        buf.freeze()
    }
}

/// Incremental frame decoder over an inbound byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {}

impl FrameDecoder {
    /// Create a new frame decoder.
    pub fn new() -> Self {
        Self {}
    }

    /// Slice the next complete frame out of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// advanced out of `buf`; on error nothing more can be salvaged from the
    /// stream and the connection should be torn down.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek the header without consuming it.
        let mut peek = &buf[..HEADER_SIZE];
        let header = CommonHeader::decode(&mut peek)?;
        header.validate()?;

        let total = header.total_size as usize;
        if total > MAX_FRAME_SIZE {
            return Err(WireError::Size(header.total_size));
        }

        if buf.len() < total {
            return Ok(None);
        }

        let mut frame_buf = buf.split_to(total).freeze();
        frame_buf.advance(HEADER_SIZE);

        let body = frame_buf.split_to(header.payload_size as usize);
        if frame_buf.get_u32_le() != END_MARKER {
            return Err(WireError::EndMarker);
        }

        let message = Message::decode_body(header.msg_type, header.sub_type, body)?;

        Ok(Some(Frame { header, message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::header::MessageType;

    fn sample_frame() -> Frame {
        Frame::new(
            Message::DataSingleDynamic {
                payload: Bytes::from_static(b"hello"),
            },
            7,
            42,
            Flags::REPLY_EXPECTED,
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = sample_frame();
        let encoded = frame.encode();
        assert_eq!(encoded.len(), frame.header.total_size as usize);

        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let encoded = sample_frame().encode();
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::from(&encoded[..HEADER_SIZE - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        // Nothing consumed while waiting for the rest of the frame.
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = sample_frame();
        let second = Frame::new(Message::HeartbeatStart, 7, 43, Flags::REPLY_EXPECTED);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode());
        buf.extend_from_slice(&second.encode());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), second);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_end_marker() {
        let encoded = sample_frame().encode();
        let mut bytes = encoded.to_vec();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;

        let mut buf = BytesMut::from(&bytes[..]);
        let result = FrameDecoder::new().decode(&mut buf);
        assert!(matches!(result, Err(WireError::EndMarker)));
        assert_eq!(
            result.unwrap_err().error_code(),
            ErrorCode::InvalidMessageSize
        );
    }

    #[test]
    fn test_inconsistent_sizes() {
        let encoded = sample_frame().encode();
        let mut bytes = encoded.to_vec();
        // Corrupt total_size (offset 12, little-endian).
        bytes[12] = bytes[12].wrapping_add(1);

        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(WireError::Size(_))
        ));
    }

    #[test]
    fn test_version_mismatch_maps_to_false_version() {
        let encoded = sample_frame().encode();
        let mut bytes = encoded.to_vec();
        bytes[3] = 2;

        let mut buf = BytesMut::from(&bytes[..]);
        let err = FrameDecoder::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FalseVersion);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = CommonHeader::new(MessageType::DataSingle, 2, Flags::empty(), 1, 1, 0);
        header.payload_size = (MAX_FRAME_SIZE + 1) as u32;
        header.total_size = (HEADER_SIZE + END_MARKER_SIZE) as u32 + header.payload_size;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(WireError::Size(_))
        ));
    }
}
