//! Wire protocol: frame header, frame type, and the streaming decoder.

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, RESPONSE_FLAG,
};

/// Process-local identifier of one accepted peer. Zero means "no specific
/// peer" and is used for server-wide events and the client's single peer.
pub type ConnectionId = u32;

/// Correlation identifier issued by the side that initiated an invoke.
/// The high bit ([`RESPONSE_FLAG`]) is set on response frames only.
pub type RequestId = u32;
