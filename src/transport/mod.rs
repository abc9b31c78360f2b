//! Transport loops and their supporting pieces.
//!
//! One OS thread per connection owns a current-thread tokio runtime and runs
//! the event loop: dialing or accepting, reading bytes into the frame
//! decoder, and draining the cross-thread write queue. Everything the loop
//! observes is reported upward through [`TransportEvents`].

pub(crate) mod client;
pub(crate) mod endpoint;
pub(crate) mod pipe;
pub(crate) mod server;
pub(crate) mod tcp;
pub(crate) mod writer;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::logging::{LogLevel, SharedLevel};
use crate::protocol::{ConnectionId, RequestId};

/// Any bidirectional byte stream the loops can drive.
pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub(crate) type BoxedStream = Box<dyn IoStream>;

/// Event hooks a transport loop reports through, wired up by the engine
/// before the loop starts. All hooks are invoked from the loop thread.
pub(crate) struct TransportEvents {
    pub on_connect: Box<dyn Fn(ConnectionId) + Send + Sync>,
    pub on_disconnect: Box<dyn Fn(ConnectionId) + Send + Sync>,
    pub on_data: Box<dyn Fn(ConnectionId, RequestId, Bytes) + Send + Sync>,
    /// A queued request frame found no live peer at write time.
    pub on_no_peer_for_request: Box<dyn Fn(ConnectionId, RequestId) + Send + Sync>,
    pub on_error: Box<dyn Fn(ConnectionId) + Send + Sync>,
    pub on_log: Box<dyn Fn(ConnectionId, LogLevel, String) + Send + Sync>,
    /// Minimum level shared with the engine; checked before formatting.
    pub log_level: SharedLevel,
}

impl TransportEvents {
    /// Emit a log event, building the message only when the level is enabled.
    pub(crate) fn log<F: FnOnce() -> String>(
        &self,
        connection: ConnectionId,
        level: LogLevel,
        message: F,
    ) {
        if self.log_level.enabled(level) {
            (self.on_log)(connection, level, message());
        }
    }
}

/// An entry on the cross-thread write queue.
#[derive(Debug)]
pub(crate) struct WriteCommand {
    /// Target peer; 0 on a client (its single peer).
    pub connection: ConnectionId,
    /// Correlation id to stamp on the frame header.
    pub request_id: RequestId,
    pub body: Bytes,
}

/// Tunables for a transport loop.
#[derive(Debug, Clone)]
pub(crate) struct TransportOptions {
    /// Bodies over this size close the offending peer.
    pub max_body_size: u32,
    /// Per-peer receive scratch buffer size.
    pub read_buffer_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_body_size: crate::protocol::DEFAULT_MAX_BODY_SIZE,
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Allocate the next peer id, skipping the reserved value 0 on wraparound.
pub(crate) fn next_connection_id(last: &mut ConnectionId) -> ConnectionId {
    *last = last.wrapping_add(1);
    if *last == 0 {
        *last = 1;
    }
    *last
}
