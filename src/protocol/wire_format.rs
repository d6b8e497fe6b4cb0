//! Wire format encoding and decoding.
//!
//! Every frame starts with a 6-byte prefix, followed (for request frames) by a
//! 17-byte header, the opaque context and the body:
//! ```text
//! ┌──────┬─────────┬──────────┬──────────────────────┬─────────┬──────┐
//! │ Flag │ Version │ Length   │ Header               │ Context │ Body │
//! │ 1    │ 1       │ 4        │ 17                   │ 0..255  │ ...  │
//! │ u8   │ u8      │ u32 BE   │                      │         │      │
//! └──────┴─────────┴──────────┴──────────────────────┴─────────┴──────┘
//!
//! Header:
//! ┌──────────┬────────────┬────────────┬──────────┬───────────────┐
//! │ AppId    │ ServiceId  │ RequestId  │ AdminId  │ ContextLength │
//! │ u32 BE   │ u32 BE     │ u32 BE     │ u32 BE   │ u8            │
//! └──────────┴────────────┴────────────┴──────────┴───────────────┘
//! ```
//!
//! `Length` counts header + context + body. All multi-byte integers are Big Endian.

/// Prefix size in bytes (flag, version, length).
pub const PREFIX_SIZE: usize = 6;

/// Header size in bytes (fixed, exactly 17).
pub const HEADER_SIZE: usize = 17;

/// Offset of the context inside a request frame.
pub const CONTEXT_OFFSET: usize = PREFIX_SIZE + HEADER_SIZE;

/// The only protocol version accepted.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum body bytes carried by a single outbound frame.
pub const MAX_CHUNK_SIZE: usize = 0x200000;

/// Default maximum inbound `length` (socket package limit of the directory).
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 0x21000;

/// Largest context the one-byte length field can describe.
pub const MAX_CONTEXT_LENGTH: usize = u8::MAX as usize;

/// Flag constants for the protocol.
pub mod flags {
    /// Message originates from a system call.
    pub const SYS_MSG: u8 = 0b0000_0001;
    /// Frame carries an RPC result rather than a request.
    pub const RESULT_MODE: u8 = 0b0000_0010;
    /// Last frame of a (possibly chunked) result.
    pub const FINISH: u8 = 0b0000_0100;
    /// Request forwarded from a browser.
    pub const TRANSPORT: u8 = 0b0000_1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// The 6-byte frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    /// Flags byte (see `flags` module).
    pub flag: u8,
    /// Protocol version.
    pub version: u8,
    /// Byte count of header + context + body.
    pub length: u32,
}

impl Prefix {
    /// Create a new prefix.
    pub fn new(flag: u8, version: u8, length: u32) -> Self {
        Self {
            flag,
            version,
            length,
        }
    }

    /// Encode prefix to bytes (Big Endian).
    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        buf[0] = self.flag;
        buf[1] = self.version;
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode prefix from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PREFIX_SIZE {
            return None;
        }
        Some(Self {
            flag: buf[0],
            version: buf[1],
            length: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }

    /// Check if this frame carries a result.
    #[inline]
    pub fn is_result(&self) -> bool {
        flags::has_flag(self.flag, flags::RESULT_MODE)
    }

    /// Total frame size on the wire.
    #[inline]
    pub fn frame_size(&self) -> usize {
        PREFIX_SIZE + self.length as usize
    }
}

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Application identifier.
    pub app_id: u32,
    /// Service identifier.
    pub service_id: u32,
    /// Request identifier assigned by the directory.
    pub request_id: u32,
    /// Administrator on whose behalf the call is made.
    pub admin_id: u32,
    /// Length of the opaque context that follows the header.
    pub context_length: u8,
}

impl Header {
    /// Create a new header.
    pub fn new(app_id: u32, service_id: u32, request_id: u32, admin_id: u32, context_length: u8) -> Self {
        Self {
            app_id,
            service_id,
            request_id,
            admin_id,
            context_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (17 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.app_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.service_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.request_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.admin_id.to_be_bytes());
        buf[16] = self.context_length;
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            app_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            service_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            request_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            admin_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            context_length: buf[16],
        })
    }
}
