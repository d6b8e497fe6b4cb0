//! Frame types, outbound encoding with chunking, and inbound decoding.
//!
//! Uses `bytes::Bytes` for cheap sharing of context and body.
//!
//! # Example
//!
//! ```
//! use servicereg_client::protocol::{decode, encode, flags, Decode, Header, InboundFrame};
//!
//! let header = Header::new(1, 2, 42, 7, 0);
//! let frames = encode(0, 1, &header, b"", b"Rtz").unwrap();
//! assert_eq!(frames.len(), 1);
//!
//! match decode(&frames[0], u32::MAX).unwrap() {
//!     Decode::Complete { frame: InboundFrame::Request(frame), .. } => {
//!         assert_eq!(frame.header.request_id, 42);
//!         assert!(flags::has_flag(frame.flag, flags::FINISH));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use bytes::Bytes;

use super::wire_format::{
    flags, Header, Prefix, CONTEXT_OFFSET, HEADER_SIZE, MAX_CHUNK_SIZE, MAX_CONTEXT_LENGTH,
    PREFIX_SIZE, PROTOCOL_VERSION,
};
use crate::error::{Result, ServiceError};

/// A complete request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Flags byte.
    pub flag: u8,
    /// Protocol version.
    pub version: u8,
    /// Decoded header.
    pub header: Header,
    /// Opaque context, echoed on every response.
    pub context: Bytes,
    /// Protocol payload.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame; the header's context length is taken from `context`.
    ///
    /// Fails when `context` is longer than [`MAX_CONTEXT_LENGTH`], as
    /// [`encode`] does.
    pub fn new(flag: u8, version: u8, header: Header, context: Bytes, body: Bytes) -> Result<Self> {
        let context_length = u8::try_from(context.len()).map_err(|_| {
            ServiceError::MalformedHeader(format!(
                "context of {} bytes exceeds {} byte limit",
                context.len(),
                MAX_CONTEXT_LENGTH
            ))
        })?;
        Ok(Self {
            flag,
            version,
            header: Header {
                context_length,
                ..header
            },
            context,
            body,
        })
    }

    /// Value of the prefix `length` field.
    #[inline]
    pub fn length(&self) -> usize {
        HEADER_SIZE + self.context.len() + self.body.len()
    }

    /// Raw header followed by the context, as sent on the wire.
    pub fn header_and_context(&self) -> Bytes {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.context.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.context);
        Bytes::from(buf)
    }

    /// Check if this is the last frame of a message.
    #[inline]
    pub fn is_finish(&self) -> bool {
        flags::has_flag(self.flag, flags::FINISH)
    }

    /// Check if the request comes from a system call.
    #[inline]
    pub fn is_sys_msg(&self) -> bool {
        flags::has_flag(self.flag, flags::SYS_MSG)
    }

    /// Check if the request was forwarded from a browser.
    #[inline]
    pub fn is_transport(&self) -> bool {
        flags::has_flag(self.flag, flags::TRANSPORT)
    }
}

/// A result-mode frame.
///
/// Results answer calls initiated by this side. Only the prefix is parsed;
/// correlation is left to a [`ResultSink`](crate::dispatcher::ResultSink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    /// Flags byte (always has `RESULT_MODE`).
    pub flag: u8,
    /// Protocol version.
    pub version: u8,
    /// Everything after the prefix.
    pub payload: Bytes,
}

impl ResultFrame {
    /// Check if this is the last frame of the result.
    #[inline]
    pub fn is_finish(&self) -> bool {
        flags::has_flag(self.flag, flags::FINISH)
    }

    /// Request id of the originating call, when the payload carries a header.
    pub fn request_id(&self) -> Option<u32> {
        Header::decode(&self.payload).map(|h| h.request_id)
    }
}

/// A frame pulled off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A call request from the directory.
    Request(Frame),
    /// A result for a call this side initiated.
    Result(ResultFrame),
    /// A frame with an unsupported protocol version (skipped).
    Unsupported { flag: u8, version: u8 },
    /// A request whose header does not fit its prefix length (skipped).
    Malformed { flag: u8, reason: String },
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// A full frame was available.
    Complete {
        /// The decoded frame.
        frame: InboundFrame,
        /// Bytes consumed from the input.
        consumed: usize,
    },
    /// The buffer does not yet hold a full frame.
    NeedMoreData,
}

/// Decode one frame from the front of `buf`.
///
/// Pure function of the input; calling it again with more bytes is safe.
/// Frames whose `length` exceeds `max_length` are rejected: past that point
/// the stream cannot be resynchronised. A request whose header is
/// inconsistent with its length is still consumed whole and surfaced as
/// [`InboundFrame::Malformed`].
pub fn decode(buf: &[u8], max_length: u32) -> Result<Decode> {
    let prefix = match Prefix::decode(buf) {
        Some(p) => p,
        None => return Ok(Decode::NeedMoreData),
    };

    if prefix.length > max_length {
        return Err(ServiceError::FrameTooLarge {
            length: prefix.length,
            max: max_length,
        });
    }

    let consumed = prefix.frame_size();
    if buf.len() < consumed {
        return Ok(Decode::NeedMoreData);
    }

    if prefix.version != PROTOCOL_VERSION {
        return Ok(Decode::Complete {
            frame: InboundFrame::Unsupported {
                flag: prefix.flag,
                version: prefix.version,
            },
            consumed,
        });
    }

    if prefix.is_result() {
        return Ok(Decode::Complete {
            frame: InboundFrame::Result(ResultFrame {
                flag: prefix.flag,
                version: prefix.version,
                payload: Bytes::copy_from_slice(&buf[PREFIX_SIZE..consumed]),
            }),
            consumed,
        });
    }

    let malformed = |reason: String| Decode::Complete {
        frame: InboundFrame::Malformed {
            flag: prefix.flag,
            reason,
        },
        consumed,
    };

    if (prefix.length as usize) < HEADER_SIZE {
        return Ok(malformed(format!(
            "length {} is shorter than the {}-byte header",
            prefix.length, HEADER_SIZE
        )));
    }

    let header = match Header::decode(&buf[PREFIX_SIZE..CONTEXT_OFFSET]) {
        Some(header) => header,
        None => return Ok(malformed("truncated header".to_string())),
    };
    let body_offset = CONTEXT_OFFSET + header.context_length as usize;
    if body_offset > consumed {
        return Ok(malformed(format!(
            "context length {} overruns frame length {}",
            header.context_length, prefix.length
        )));
    }

    let frame = Frame {
        flag: prefix.flag,
        version: prefix.version,
        header,
        context: Bytes::copy_from_slice(&buf[CONTEXT_OFFSET..body_offset]),
        body: Bytes::copy_from_slice(&buf[body_offset..consumed]),
    };

    Ok(Decode::Complete {
        frame: InboundFrame::Request(frame),
        consumed,
    })
}

/// Encode a body into one or more frames sharing `header` and `context`.
///
/// Bodies up to [`MAX_CHUNK_SIZE`] produce a single frame with `FINISH` set.
/// Larger bodies are split into chunks; only the last carries `FINISH`.
pub fn encode(flag: u8, version: u8, header: &Header, context: &[u8], body: &[u8]) -> Result<Vec<Bytes>> {
    if context.len() > MAX_CONTEXT_LENGTH {
        return Err(ServiceError::Protocol(format!(
            "context of {} bytes exceeds {} byte limit",
            context.len(),
            MAX_CONTEXT_LENGTH
        )));
    }

    let header = Header {
        context_length: context.len() as u8,
        ..*header
    };
    let mut header_and_context = Vec::with_capacity(HEADER_SIZE + context.len());
    header_and_context.extend_from_slice(&header.encode());
    header_and_context.extend_from_slice(context);

    Ok(build_frames(flag, version, &header_and_context, body))
}

/// Build frames from an already-encoded header+context block.
///
/// Used for responses, which reuse the request's raw header and context.
pub fn build_frames(flag: u8, version: u8, header_and_context: &[u8], body: &[u8]) -> Vec<Bytes> {
    if body.len() <= MAX_CHUNK_SIZE {
        return vec![build_one(flag | flags::FINISH, version, header_and_context, body)];
    }

    let mut frames = Vec::with_capacity(body.len().div_ceil(MAX_CHUNK_SIZE));
    let mut chunks = body.chunks(MAX_CHUNK_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let chunk_flag = if chunks.peek().is_none() {
            flag | flags::FINISH
        } else {
            flag & !flags::FINISH
        };
        frames.push(build_one(chunk_flag, version, header_and_context, chunk));
    }
    frames
}

fn build_one(flag: u8, version: u8, header_and_context: &[u8], body: &[u8]) -> Bytes {
    let length = (header_and_context.len() + body.len()) as u32;
    let mut buf = Vec::with_capacity(PREFIX_SIZE + length as usize);
    buf.extend_from_slice(&Prefix::new(flag, version, length).encode());
    buf.extend_from_slice(header_and_context);
    buf.extend_from_slice(body);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes(flag: u8, header: Header, context: &[u8], body: &[u8]) -> Vec<u8> {
        let frames = encode(flag, PROTOCOL_VERSION, &header, context, body).unwrap();
        assert_eq!(frames.len(), 1);
        frames[0].to_vec()
    }

    fn expect_request(decoded: Decode) -> (Frame, usize) {
        match decoded {
            Decode::Complete {
                frame: InboundFrame::Request(frame),
                consumed,
            } => (frame, consumed),
            other => panic!("expected request frame, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_single_frame_sets_finish() {
        let header = Header::new(1, 2, 3, 4, 0);
        let frames = encode(flags::SYS_MSG, 1, &header, b"ctx", b"hello").unwrap();

        assert_eq!(frames.len(), 1);
        let bytes = &frames[0];
        assert_eq!(bytes[0], flags::SYS_MSG | flags::FINISH);
        assert_eq!(bytes[1], 1);
        assert_eq!(
            u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize,
            HEADER_SIZE + 3 + 5
        );
        assert_eq!(bytes[CONTEXT_OFFSET - 1], 3); // context length
        assert_eq!(&bytes[CONTEXT_OFFSET..CONTEXT_OFFSET + 3], b"ctx");
        assert_eq!(&bytes[CONTEXT_OFFSET + 3..], b"hello");
    }

    #[test]
    fn test_decode_request() {
        let header = Header::new(10, 20, 30, 40, 0);
        let bytes = request_bytes(flags::TRANSPORT, header, b"abc", b"Cs1\"a\"z");

        let (frame, consumed) = expect_request(decode(&bytes, u32::MAX).unwrap());
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.header.app_id, 10);
        assert_eq!(frame.header.service_id, 20);
        assert_eq!(frame.header.request_id, 30);
        assert_eq!(frame.header.admin_id, 40);
        assert_eq!(frame.header.context_length, 3);
        assert_eq!(&frame.context[..], b"abc");
        assert_eq!(&frame.body[..], b"Cs1\"a\"z");
        assert!(frame.is_transport());
        assert!(frame.is_finish());
        assert_eq!(frame.length(), HEADER_SIZE + 3 + 7);
    }

    #[test]
    fn test_decode_needs_more_data() {
        let header = Header::new(1, 1, 1, 1, 0);
        let bytes = request_bytes(0, header, b"", b"body");

        assert_eq!(decode(&bytes[..3], u32::MAX).unwrap(), Decode::NeedMoreData);
        assert_eq!(
            decode(&bytes[..bytes.len() - 1], u32::MAX).unwrap(),
            Decode::NeedMoreData
        );
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let header = Header::new(1, 1, 1, 1, 0);
        let mut bytes = request_bytes(0, header, b"", b"one");
        let first_len = bytes.len();
        bytes.extend_from_slice(&request_bytes(0, header, b"", b"two"));

        let (frame, consumed) = expect_request(decode(&bytes, u32::MAX).unwrap());
        assert_eq!(consumed, first_len);
        assert_eq!(&frame.body[..], b"one");
    }

    #[test]
    fn test_decode_result_mode_skips_header() {
        // Payload shorter than a header is fine for result frames.
        let mut bytes = Prefix::new(flags::RESULT_MODE | flags::FINISH, 1, 2).encode().to_vec();
        bytes.extend_from_slice(b"Rz");

        match decode(&bytes, u32::MAX).unwrap() {
            Decode::Complete {
                frame: InboundFrame::Result(result),
                consumed,
            } => {
                assert_eq!(consumed, 8);
                assert!(result.is_finish());
                assert_eq!(&result.payload[..], b"Rz");
                assert_eq!(result.request_id(), None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut bytes = Prefix::new(0, 2, 17).encode().to_vec();
        bytes.extend_from_slice(&[0u8; 17]);

        let decoded = decode(&bytes, u32::MAX).unwrap();
        assert_eq!(
            decoded,
            Decode::Complete {
                frame: InboundFrame::Unsupported { flag: 0, version: 2 },
                consumed: 23,
            }
        );
    }

    #[test]
    fn test_decode_length_shorter_than_header() {
        let mut bytes = Prefix::new(0, 1, 4).encode().to_vec();
        bytes.extend_from_slice(b"abcd");

        match decode(&bytes, u32::MAX).unwrap() {
            Decode::Complete {
                frame: InboundFrame::Malformed { reason, .. },
                consumed,
            } => {
                assert_eq!(consumed, PREFIX_SIZE + 4);
                assert!(reason.contains("shorter"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_context_overrun() {
        let header = Header::new(1, 1, 1, 1, 200);
        let mut bytes = Prefix::new(0, 1, HEADER_SIZE as u32 + 2).encode().to_vec();
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(b"xy");

        match decode(&bytes, u32::MAX).unwrap() {
            Decode::Complete {
                frame: InboundFrame::Malformed { reason, .. },
                consumed,
            } => {
                assert_eq!(consumed, bytes.len());
                assert!(reason.contains("overruns"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_too_large() {
        let bytes = Prefix::new(0, 1, 1000).encode();
        let err = decode(&bytes, 100).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::FrameTooLarge {
                length: 1000,
                max: 100
            }
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_context() {
        let header = Header::default();
        let context = vec![0u8; 256];
        assert!(encode(0, 1, &header, &context, b"").is_err());
    }

    #[test]
    fn test_new_rejects_oversized_context() {
        let header = Header::new(1, 2, 3, 4, 0);
        let err = Frame::new(0, 1, header, Bytes::from(vec![0u8; 256]), Bytes::new()).unwrap_err();
        assert!(matches!(err, ServiceError::MalformedHeader(_)));

        let frame = Frame::new(0, 1, header, Bytes::from(vec![0u8; 255]), Bytes::new()).unwrap();
        assert_eq!(frame.header.context_length, 255);
    }

    #[test]
    fn test_encode_empty_body() {
        let header = Header::new(1, 2, 3, 4, 0);
        let frames = encode(0, 1, &header, b"", b"").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), PREFIX_SIZE + HEADER_SIZE);
    }

    #[test]
    fn test_chunking_just_over_limit() {
        let header = Header::new(7, 8, 9, 10, 0);
        let body: Vec<u8> = (0..MAX_CHUNK_SIZE + 1).map(|i| (i % 251) as u8).collect();
        let frames = encode(flags::SYS_MSG | flags::RESULT_MODE, 1, &header, b"ctx", &body).unwrap();

        assert_eq!(frames.len(), 2);

        let mut reassembled = Vec::new();
        for (i, bytes) in frames.iter().enumerate() {
            let prefix = Prefix::decode(bytes).unwrap();
            let finish = flags::has_flag(prefix.flag, flags::FINISH);
            assert_eq!(finish, i == 1, "only the last chunk carries FINISH");
            assert!(flags::has_flag(prefix.flag, flags::SYS_MSG));
            assert_eq!(prefix.frame_size(), bytes.len());
            assert_eq!(&bytes[PREFIX_SIZE..CONTEXT_OFFSET], &header.encode_with_context_len(3));
            assert_eq!(&bytes[CONTEXT_OFFSET..CONTEXT_OFFSET + 3], b"ctx");
            reassembled.extend_from_slice(&bytes[CONTEXT_OFFSET + 3..]);
        }

        assert_eq!(reassembled, body);
    }

    #[test]
    fn test_chunking_exact_limit_is_single_frame() {
        let body = vec![1u8; MAX_CHUNK_SIZE];
        let frames = build_frames(0, 1, &Header::default().encode(), &body);
        assert_eq!(frames.len(), 1);
        assert!(flags::has_flag(frames[0][0], flags::FINISH));
    }

    #[test]
    fn test_header_and_context_reencodes() {
        let header = Header::new(1, 2, 3, 4, 0);
        let bytes = request_bytes(0, header, b"zz", b"");
        let (frame, _) = expect_request(decode(&bytes, u32::MAX).unwrap());
        assert_eq!(&frame.header_and_context()[..], &bytes[PREFIX_SIZE..]);
    }

    impl Header {
        fn encode_with_context_len(&self, len: u8) -> [u8; HEADER_SIZE] {
            Header {
                context_length: len,
                ..*self
            }
            .encode()
        }
    }
}
