//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary envelope used on the directory socket:
//! - 6-byte prefix and 17-byte header encoding/decoding
//! - Outbound chunking of bodies larger than 2 MiB
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frames, decode, encode, Decode, Frame, InboundFrame, ResultFrame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, Header, Prefix, CONTEXT_OFFSET, DEFAULT_MAX_FRAME_LENGTH, HEADER_SIZE, MAX_CHUNK_SIZE,
    MAX_CONTEXT_LENGTH, PREFIX_SIZE, PROTOCOL_VERSION,
};
