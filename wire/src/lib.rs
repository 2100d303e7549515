//! Wire protocol framing, typed messages, and codec for lattice sessions.
//!
//! This crate implements the low-level wire protocol of the session layer:
//! the fixed common header, every typed sub-message, and an incremental
//! decoder that slices complete frames out of an inbound byte buffer.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | Common Header (20B)  | type, subType, flags,      |
//! |                      | version, messageId,        |
//! |                      | sessionId, totalSize,      |
//! |                      | payloadSize                |
//! +----------------------+----------------------------+
//! | body                 | subtype-specific layout    |
//! +----------------------+----------------------------+
//! | u32 end-marker       | 0xDEADCAFE                 |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are little-endian. Frames are self-delimiting via the
//! `totalSize` header field; the end-marker guards against framing drift.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod message;

pub use codec::{Frame, FrameDecoder, MAX_FRAME_SIZE};
pub use error::{ErrorCode, WireError};
pub use header::{
    CommonHeader, Flags, MessageType, END_MARKER, END_MARKER_SIZE, HEADER_SIZE, WIRE_VERSION,
};
pub use message::{
    data_multi_sub, data_single_sub, heartbeat_sub, session_sub, Message, STATIC_STRIDE,
};
