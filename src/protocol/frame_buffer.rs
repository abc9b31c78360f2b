//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for the carry buffer and a two-state machine for
//! fragmented frames:
//! - `WaitingForHeader`: need at least 8 bytes
//! - `WaitingForBody`: header parsed, need `body_size` more bytes
//!
//! A single `push` handles a read spanning multiple frames, a frame split
//! across many reads, and header-plus-partial-body reads.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header },
}

/// Buffer accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default body-size limit (1 GiB).
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with a custom body-size limit.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns every frame completed by this chunk; partial data is carried
    /// over for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error if a header announces a body over the limit. The
    /// caller is expected to close the stream; the buffer state is
    /// unspecified afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = Header::decode(&self.buffer[..HEADER_SIZE])
                    .expect("buffer has enough bytes");
                header.validate(self.max_body_size)?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.body_size == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new())));
                }

                self.state = State::WaitingForBody { header };
                self.try_extract_one()
            }

            State::WaitingForBody { header } => {
                let needed = header.body_size as usize;
                if self.buffer.len() < needed {
                    return Ok(None);
                }

                let body = self.buffer.split_to(needed).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, body)))
            }
        }
    }

    /// Number of buffered bytes not yet assembled into a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
