//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` to hold bytes that have arrived from the socket but
//! do not yet form a complete frame. Each push runs [`decode`] until the
//! buffer runs dry.
//!
//! Partial frames are reassembled across reads. Chunked *bodies* (several
//! request frames without `FINISH`) are not: each frame is surfaced on its own.
//!
//! # Example
//!
//! ```ignore
//! use servicereg_client::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk)?;
//! for frame in frames {
//!     println!("{:?}", frame);
//! }
//! ```

use bytes::{Buf, BytesMut};

use super::frame::{decode, Decode, InboundFrame};
use super::wire_format::DEFAULT_MAX_FRAME_LENGTH;
use crate::error::Result;

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed prefix `length`.
    max_frame_length: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame length: `DEFAULT_MAX_FRAME_LENGTH`.
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Create a new frame buffer with custom max frame length.
    pub fn with_max_length(max_frame_length: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_length,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Returns error if a frame is oversized. The stream cannot be
    /// resynchronised after that; the caller should drop the connection.
    /// Frames with an inconsistent header are returned as
    /// [`InboundFrame::Malformed`] and the stream carries on.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<InboundFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Decode::Complete { frame, consumed } = decode(&self.buffer, self.max_frame_length)? {
            self.buffer.advance(consumed);
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Header, Prefix};

    fn make_frame_bytes(request_id: u32, body: &[u8]) -> Vec<u8> {
        let header = Header::new(1, 2, request_id, 3, 0);
        encode(0, 1, &header, b"", body).unwrap()[0].to_vec()
    }

    fn request_id(frame: &InboundFrame) -> u32 {
        match frame {
            InboundFrame::Request(f) => f.header.request_id,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(request_id(&frames[0]), 42);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = Vec::new();
        for id in 1..=3 {
            combined.extend_from_slice(&make_frame_bytes(id, b"x"));
        }

        let frames = buffer.push(&combined).unwrap();
        let ids: Vec<u32> = frames.iter().map(request_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_prefix_and_body() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(7, b"this body arrives in pieces");

        assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
        assert!(buffer.push(&bytes[4..30]).unwrap().is_empty());
        let frames = buffer.push(&bytes[30..]).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(request_id(&frames[0]), 7);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(9, b"hi");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(request_id(&all[0]), 9);
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = make_frame_bytes(1, b"first");
        let second = make_frame_bytes(2, b"second");

        let mut data = first.clone();
        data.extend_from_slice(&second[..5]);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(buffer.len(), 5);

        let frames = buffer.push(&second[5..]).unwrap();
        assert_eq!(request_id(&frames[0]), 2);
    }

    #[test]
    fn test_max_length_validation() {
        let mut buffer = FrameBuffer::with_max_length(100);
        let result = buffer.push(&Prefix::new(0, 1, 1000).encode());

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_unsupported_version_is_skipped_over() {
        let mut buffer = FrameBuffer::new();
        let mut data = Prefix::new(0, 9, 3).encode().to_vec();
        data.extend_from_slice(b"???");
        data.extend_from_slice(&make_frame_bytes(5, b"ok"));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], InboundFrame::Unsupported { version: 9, .. }));
        assert_eq!(request_id(&frames[1]), 5);
    }

    #[test]
    fn test_bad_context_frame_is_skipped_over() {
        let mut buffer = FrameBuffer::new();
        let mut data = Prefix::new(0, 1, 19).encode().to_vec();
        data.extend_from_slice(&Header::new(1, 2, 3, 4, 200).encode());
        data.extend_from_slice(b"xy");
        data.extend_from_slice(&make_frame_bytes(6, b"ok"));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], InboundFrame::Malformed { .. }));
        assert_eq!(request_id(&frames[1]), 6);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&make_frame_bytes(1, b"x")[..3]).unwrap();
        assert!(!buffer.is_empty());

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
