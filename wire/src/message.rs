//! Typed sub-messages for every `(type, subType)` pair of the protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, WireError};
use crate::header::MessageType;

/// Payload stride for single-block static frames; payloads are zero-padded
/// to the next multiple of this value.
pub const STATIC_STRIDE: usize = 8;

/// Session subtypes.
pub mod session_sub {
    /// Client opens the handshake.
    pub const INIT_START: u8 = 1;
    /// Server finalizes the handshake.
    pub const INIT_REPLY: u8 = 2;
    /// Server rejects the offered id and proposes another.
    pub const ID_CHANGE: u8 = 3;
    /// Client confirms the server-chosen id.
    pub const ID_CONFIRM: u8 = 4;
    /// Orderly teardown request.
    pub const CLOSE_START: u8 = 5;
    /// Orderly teardown acknowledgment.
    pub const CLOSE_REPLY: u8 = 6;
}

/// Heartbeat subtypes.
pub mod heartbeat_sub {
    /// Liveness probe, reply expected.
    pub const START: u8 = 1;
    /// Liveness probe answer.
    pub const REPLY: u8 = 2;
}

/// Single-block data subtypes.
pub mod data_single_sub {
    /// Fixed-stride payload.
    pub const STATIC: u8 = 1;
    /// Exact-length payload.
    pub const DYNAMIC: u8 = 2;
    /// Acknowledgment for a reply-expected data frame.
    pub const REPLY: u8 = 3;
}

/// Multiblock data subtypes.
pub mod data_multi_sub {
    /// Announce a transfer and its total size.
    pub const INIT: u8 = 1;
    /// Accept or refuse an announced transfer.
    pub const INIT_REPLY: u8 = 2;
    /// One part of the payload.
    pub const STATIC: u8 = 3;
    /// All parts sent.
    pub const FINISH: u8 = 4;
    /// Sender-initiated cancel.
    pub const ABORT_INIT: u8 = 5;
    /// Cancel acknowledgment.
    pub const ABORT_REPLY: u8 = 6;
}

/// A decoded sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `SESSION / INIT_START`
    SessionInitStart {
        /// Id the initiator would like to use; the server is authoritative.
        offered_session_id: u32,
        /// Opaque value surfaced to the server application.
        session_identifier: u64,
    },
    /// `SESSION / INIT_REPLY`
    SessionInitReply {
        /// Final session id on both sides.
        session_id: u32,
    },
    /// `SESSION / ID_CHANGE`
    SessionIdChange {
        /// Id originally offered by the client.
        old_offered_session_id: u32,
        /// Id picked by the server instead.
        new_offered_session_id: u32,
    },
    /// `SESSION / ID_CONFIRM`
    SessionIdConfirm {
        /// Server-chosen id echoed back by the client.
        confirmed_session_id: u32,
    },
    /// `SESSION / CLOSE_START`
    SessionCloseStart {
        /// Session being torn down.
        session_id: u32,
        /// Whether the initiator waits for [`Message::SessionCloseReply`].
        reply_expected: bool,
    },
    /// `SESSION / CLOSE_REPLY`
    SessionCloseReply {
        /// Session being torn down.
        session_id: u32,
    },
    /// `HEARTBEAT / START`
    HeartbeatStart,
    /// `HEARTBEAT / REPLY`
    HeartbeatReply,
    /// `ERROR / *`; the subtype mirrors the embedded code.
    Error {
        /// Error classification.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
    /// `DATA_SINGLE / STATIC`
    DataSingleStatic {
        /// Payload, padded to [`STATIC_STRIDE`] on the wire.
        payload: Bytes,
    },
    /// `DATA_SINGLE / DYNAMIC`
    DataSingleDynamic {
        /// Payload, exact length on the wire.
        payload: Bytes,
    },
    /// `DATA_SINGLE / REPLY`
    DataSingleReply,
    /// `DATA_MULTI / INIT`
    DataMultiInit {
        /// Sender-chosen non-zero transfer id.
        multiblock_id: u64,
        /// Total payload size in bytes.
        total_size: u64,
    },
    /// `DATA_MULTI / INIT_REPLY`
    DataMultiInitReply {
        /// Transfer id being answered.
        multiblock_id: u64,
        /// Whether the receiver allocated an inbound buffer.
        ok: bool,
    },
    /// `DATA_MULTI / STATIC`
    DataMultiStatic {
        /// Transfer id this part belongs to.
        multiblock_id: u64,
        /// Total number of parts in the transfer.
        total_parts: u32,
        /// Zero-based index of this part.
        part_id: u32,
        /// Part payload.
        payload: Bytes,
    },
    /// `DATA_MULTI / FINISH`
    DataMultiFinish {
        /// Completed transfer id.
        multiblock_id: u64,
    },
    /// `DATA_MULTI / ABORT_INIT`
    DataMultiAbortInit {
        /// Transfer id being cancelled.
        multiblock_id: u64,
    },
    /// `DATA_MULTI / ABORT_REPLY`
    DataMultiAbortReply {
        /// Transfer id that was cancelled.
        multiblock_id: u64,
    },
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(STATIC_STRIDE) * STATIC_STRIDE
}

impl Message {
    /// The `(type, subType)` pair of this message.
    pub fn kind(&self) -> (MessageType, u8) {
        match self {
            Message::SessionInitStart { .. } => (MessageType::Session, session_sub::INIT_START),
            Message::SessionInitReply { .. } => (MessageType::Session, session_sub::INIT_REPLY),
            Message::SessionIdChange { .. } => (MessageType::Session, session_sub::ID_CHANGE),
            Message::SessionIdConfirm { .. } => (MessageType::Session, session_sub::ID_CONFIRM),
            Message::SessionCloseStart { .. } => (MessageType::Session, session_sub::CLOSE_START),
            Message::SessionCloseReply { .. } => (MessageType::Session, session_sub::CLOSE_REPLY),
            Message::HeartbeatStart => (MessageType::Heartbeat, heartbeat_sub::START),
            Message::HeartbeatReply => (MessageType::Heartbeat, heartbeat_sub::REPLY),
            Message::Error { code, .. } => (MessageType::Error, *code as u8),
            Message::DataSingleStatic { .. } => (MessageType::DataSingle, data_single_sub::STATIC),
            Message::DataSingleDynamic { .. } => {
                (MessageType::DataSingle, data_single_sub::DYNAMIC)
            }
            Message::DataSingleReply => (MessageType::DataSingle, data_single_sub::REPLY),
            Message::DataMultiInit { .. } => (MessageType::DataMulti, data_multi_sub::INIT),
            Message::DataMultiInitReply { .. } => {
                (MessageType::DataMulti, data_multi_sub::INIT_REPLY)
            }
            Message::DataMultiStatic { .. } => (MessageType::DataMulti, data_multi_sub::STATIC),
            Message::DataMultiFinish { .. } => (MessageType::DataMulti, data_multi_sub::FINISH),
            Message::DataMultiAbortInit { .. } => {
                (MessageType::DataMulti, data_multi_sub::ABORT_INIT)
            }
            Message::DataMultiAbortReply { .. } => {
                (MessageType::DataMulti, data_multi_sub::ABORT_REPLY)
            }
        }
    }

    /// Size of the encoded body in bytes.
    pub fn body_size(&self) -> usize {
        match self {
            Message::SessionInitStart { .. } => 12,
            Message::SessionInitReply { .. } => 4,
            Message::SessionIdChange { .. } => 8,
            Message::SessionIdConfirm { .. } => 4,
            Message::SessionCloseStart { .. } => 5,
            Message::SessionCloseReply { .. } => 4,
            Message::HeartbeatStart | Message::HeartbeatReply | Message::DataSingleReply => 0,
            Message::Error { message, .. } => 5 + message.len(),
            Message::DataSingleStatic { payload } => 4 + padded_len(payload.len()),
            Message::DataSingleDynamic { payload } => 4 + payload.len(),
            Message::DataMultiInit { .. } => 16,
            Message::DataMultiInitReply { .. } => 9,
            Message::DataMultiStatic { payload, .. } => 20 + payload.len(),
            Message::DataMultiFinish { .. }
            | Message::DataMultiAbortInit { .. }
            | Message::DataMultiAbortReply { .. } => 8,
        }
    }

    /// Encode the body (little-endian) into `buf`.
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::SessionInitStart {
                offered_session_id,
                session_identifier,
            } => {
                buf.put_u32_le(*offered_session_id);
                buf.put_u64_le(*session_identifier);
            }
            Message::SessionInitReply { session_id } => buf.put_u32_le(*session_id),
            Message::SessionIdChange {
                old_offered_session_id,
                new_offered_session_id,
            } => {
                buf.put_u32_le(*old_offered_session_id);
                buf.put_u32_le(*new_offered_session_id);
            }
            Message::SessionIdConfirm {
                confirmed_session_id,
            } => buf.put_u32_le(*confirmed_session_id),
            Message::SessionCloseStart {
                session_id,
                reply_expected,
            } => {
                buf.put_u32_le(*session_id);
                buf.put_u8(u8::from(*reply_expected));
            }
            Message::SessionCloseReply { session_id } => buf.put_u32_le(*session_id),
            Message::HeartbeatStart | Message::HeartbeatReply | Message::DataSingleReply => {}
            Message::Error { code, message } => {
                buf.put_u8(*code as u8);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
            Message::DataSingleStatic { payload } => {
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
                buf.put_bytes(0, padded_len(payload.len()) - payload.len());
            }
            Message::DataSingleDynamic { payload } => {
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            Message::DataMultiInit {
                multiblock_id,
                total_size,
            } => {
                buf.put_u64_le(*multiblock_id);
                buf.put_u64_le(*total_size);
            }
            Message::DataMultiInitReply { multiblock_id, ok } => {
                buf.put_u64_le(*multiblock_id);
                buf.put_u8(if *ok { 0 } else { 1 });
            }
            Message::DataMultiStatic {
                multiblock_id,
                total_parts,
                part_id,
                payload,
            } => {
                buf.put_u64_le(*multiblock_id);
                buf.put_u32_le(*total_parts);
                buf.put_u32_le(*part_id);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            Message::DataMultiFinish { multiblock_id }
            | Message::DataMultiAbortInit { multiblock_id }
            | Message::DataMultiAbortReply { multiblock_id } => {
                buf.put_u64_le(*multiblock_id);
            }
        }
    }

    /// Decode a body of `msg_type`/`sub_type` from exactly `body` bytes.
    pub fn decode_body(
        msg_type: MessageType,
        sub_type: u8,
        mut body: Bytes,
    ) -> Result<Self, WireError> {
        let message = match (msg_type, sub_type) {
            (MessageType::Session, session_sub::INIT_START) => {
                check_len(&body, 12)?;
                Message::SessionInitStart {
                    offered_session_id: body.get_u32_le(),
                    session_identifier: body.get_u64_le(),
                }
            }
            (MessageType::Session, session_sub::INIT_REPLY) => {
                check_len(&body, 4)?;
                Message::SessionInitReply {
                    session_id: body.get_u32_le(),
                }
            }
            (MessageType::Session, session_sub::ID_CHANGE) => {
                check_len(&body, 8)?;
                Message::SessionIdChange {
                    old_offered_session_id: body.get_u32_le(),
                    new_offered_session_id: body.get_u32_le(),
                }
            }
            (MessageType::Session, session_sub::ID_CONFIRM) => {
                check_len(&body, 4)?;
                Message::SessionIdConfirm {
                    confirmed_session_id: body.get_u32_le(),
                }
            }
            (MessageType::Session, session_sub::CLOSE_START) => {
                check_len(&body, 5)?;
                Message::SessionCloseStart {
                    session_id: body.get_u32_le(),
                    reply_expected: body.get_u8() != 0,
                }
            }
            (MessageType::Session, session_sub::CLOSE_REPLY) => {
                check_len(&body, 4)?;
                Message::SessionCloseReply {
                    session_id: body.get_u32_le(),
                }
            }
            (MessageType::Heartbeat, heartbeat_sub::START) => {
                check_len(&body, 0)?;
                Message::HeartbeatStart
            }
            (MessageType::Heartbeat, heartbeat_sub::REPLY) => {
                check_len(&body, 0)?;
                Message::HeartbeatReply
            }
            (MessageType::Error, _) => {
                if body.remaining() < 5 {
                    return Err(WireError::Malformed);
                }
                let code = ErrorCode::try_from(body.get_u8())?;
                let len = body.get_u32_le() as usize;
                if body.remaining() < len {
                    return Err(WireError::Malformed);
                }
                let text = body.split_to(len);
                Message::Error {
                    code,
                    message: String::from_utf8_lossy(&text).into_owned(),
                }
            }
            (MessageType::DataSingle, data_single_sub::STATIC) => {
                if body.remaining() < 4 {
                    return Err(WireError::Malformed);
                }
                let len = body.get_u32_le() as usize;
                if body.remaining() != padded_len(len) {
                    return Err(WireError::Malformed);
                }
                Message::DataSingleStatic {
                    payload: body.split_to(len),
                }
            }
            (MessageType::DataSingle, data_single_sub::DYNAMIC) => {
                if body.remaining() < 4 {
                    return Err(WireError::Malformed);
                }
                let len = body.get_u32_le() as usize;
                if body.remaining() != len {
                    return Err(WireError::Malformed);
                }
                Message::DataSingleDynamic { payload: body }
            }
            (MessageType::DataSingle, data_single_sub::REPLY) => {
                check_len(&body, 0)?;
                Message::DataSingleReply
            }
            (MessageType::DataMulti, data_multi_sub::INIT) => {
                check_len(&body, 16)?;
                Message::DataMultiInit {
                    multiblock_id: body.get_u64_le(),
                    total_size: body.get_u64_le(),
                }
            }
            (MessageType::DataMulti, data_multi_sub::INIT_REPLY) => {
                check_len(&body, 9)?;
                Message::DataMultiInitReply {
                    multiblock_id: body.get_u64_le(),
                    ok: body.get_u8() == 0,
                }
            }
            (MessageType::DataMulti, data_multi_sub::STATIC) => {
                if body.remaining() < 20 {
                    return Err(WireError::Malformed);
                }
                let multiblock_id = body.get_u64_le();
                let total_parts = body.get_u32_le();
                let part_id = body.get_u32_le();
                let len = body.get_u32_le() as usize;
                if body.remaining() != len {
                    return Err(WireError::Malformed);
                }
                Message::DataMultiStatic {
                    multiblock_id,
                    total_parts,
                    part_id,
                    payload: body,
                }
            }
            (MessageType::DataMulti, data_multi_sub::FINISH) => {
                check_len(&body, 8)?;
                Message::DataMultiFinish {
                    multiblock_id: body.get_u64_le(),
                }
            }
            (MessageType::DataMulti, data_multi_sub::ABORT_INIT) => {
                check_len(&body, 8)?;
                Message::DataMultiAbortInit {
                    multiblock_id: body.get_u64_le(),
                }
            }
            (MessageType::DataMulti, data_multi_sub::ABORT_REPLY) => {
                check_len(&body, 8)?;
                Message::DataMultiAbortReply {
                    multiblock_id: body.get_u64_le(),
                }
            }
            (t, s) => return Err(WireError::SubType(t as u8, s)),
        };

        Ok(message)
    }
}

fn check_len(body: &Bytes, expected: usize) -> Result<(), WireError> {
    if body.len() != expected {
        return Err(WireError::Malformed);
    }
    Ok(())
}
