//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌────────────┬────────────┬──────────────┐
//! │ request_id │ body_size  │ body (bytes) │
//! │  4 bytes   │  4 bytes   │  body_size B │
//! │ uint32 LE  │ uint32 LE  │              │
//! └────────────┴────────────┴──────────────┘
//! ```
//!
//! Both integers are Little Endian. The original wire format left byte order
//! to the host; this implementation fixes little-endian as canonical.

use crate::error::{PipelinkError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// High bit of `request_id`: set on responses, clear on requests.
pub const RESPONSE_FLAG: u32 = 0x8000_0000;

/// Default maximum body size accepted from a peer (1 GiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1_073_741_824;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Correlation id. 0 = fire-and-forget message; high bit = response.
    pub request_id: u32,
    /// Body length in bytes.
    pub body_size: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(request_id: u32, body_size: u32) -> Self {
        Self {
            request_id,
            body_size,
        }
    }

    /// Encode header to bytes (Little Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.request_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.body_size.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            body_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Reject bodies over the given limit.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.body_size > max_body_size {
            return Err(PipelinkError::Protocol(format!(
                "body size {} exceeds maximum {}",
                self.body_size, max_body_size
            )));
        }
        Ok(())
    }

    /// Check if this is a fire-and-forget message (no reply expected).
    #[inline]
    pub fn is_message(&self) -> bool {
        self.request_id == 0
    }

    /// Check if this is a response to a prior request.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.request_id & RESPONSE_FLAG != 0
    }

    /// Check if this is an incoming request expecting a response.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.request_id != 0 && !self.is_response()
    }

    /// The correlation id with the response flag stripped.
    #[inline]
    pub fn base_id(&self) -> u32 {
        self.request_id & !RESPONSE_FLAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(42, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header::new(0x0403_0201, 0x0807_0605);
        let bytes = header.encode();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(bytes[2], 0x03);
        assert_eq!(bytes[3], 0x04);

        assert_eq!(bytes[4], 0x05);
        assert_eq!(bytes[5], 0x06);
        assert_eq!(bytes[6], 0x07);
        assert_eq!(bytes[7], 0x08);
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        let header = Header::new(1, 0);
        assert_eq!(header.encode().len(), 8);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_request_kind_classification() {
        assert!(Header::new(0, 0).is_message());
        assert!(!Header::new(0, 0).is_request());
        assert!(!Header::new(0, 0).is_response());

        let request = Header::new(7, 0);
        assert!(request.is_request());
        assert!(!request.is_message());
        assert!(!request.is_response());

        let response = Header::new(7 | RESPONSE_FLAG, 0);
        assert!(response.is_response());
        assert!(!response.is_request());
        assert_eq!(response.base_id(), 7);
    }

    #[test]
    fn test_validate_body_too_large() {
        let header = Header::new(1, 1_000_000);
        let result = header.validate(100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_at_limit() {
        let header = Header::new(1, 100);
        assert!(header.validate(100).is_ok());
    }

    #[test]
    fn test_response_flag_is_high_bit() {
        assert_eq!(RESPONSE_FLAG, 1u32 << 31);
        assert_eq!(u32::MAX & !RESPONSE_FLAG, 0x7FFF_FFFF);
    }
}
