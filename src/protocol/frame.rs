//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and body.
//! Uses `bytes::Bytes` for zero-copy body sharing.

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the correlation id.
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.header.request_id
    }

    /// Check if this is a fire-and-forget message.
    #[inline]
    pub fn is_message(&self) -> bool {
        self.header.is_message()
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Check if this is an incoming request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Prepends the 8-byte header to the body in one contiguous buffer.
pub fn build_frame(request_id: u32, body: &[u8]) -> Vec<u8> {
    let header = Header::new(request_id, body.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let header = Header::new(42, 5);
        let body = Bytes::from_static(b"hello");
        let frame = Frame::new(header, body);

        assert_eq!(frame.request_id(), 42);
        assert_eq!(frame.body(), b"hello");
        assert!(frame.is_request());
    }

    #[test]
    fn test_frame_empty_body() {
        let frame = Frame::new(Header::new(0, 0), Bytes::new());

        assert!(frame.body().is_empty());
        assert!(frame.is_message());
    }

    #[test]
    fn test_build_frame() {
        let bytes = build_frame(42, b"hello");

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let header = Header::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.request_id, 42);
        assert_eq!(header.body_size, 5);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_frame_empty_body() {
        let bytes = build_frame(1, b"");
        assert_eq!(bytes.len(), HEADER_SIZE);
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let bytes = build_frame(456, b"0123456789");

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_id(), 456);
        assert_eq!(frames[0].body(), b"0123456789");
    }
}
