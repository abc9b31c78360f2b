//! Connection engines: the user-facing objects tying transport, delivery
//! queue, correlation table, and handler slots together.

mod client;
mod server;
mod single;

pub use client::ClientConnection;
pub use server::ServerConnection;
pub use single::SingleServerConnection;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, Weak};

use bytes::Bytes;

use crate::protocol::{ConnectionId, RequestId, RESPONSE_FLAG};

/// Log category for engine-level events.
pub(crate) const CONNECTION_CATEGORY: &str = "connection";
/// Log category for events reported by the transport loop.
pub(crate) const TRANSPORT_CATEGORY: &str = "transport";

/// Outcome delivered to an invoke callback, exactly once per invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeResult {
    /// The peer responded; the body is the response payload.
    Good,
    /// The peer disconnected (or was never reachable) before responding.
    RemoteDisconnect,
    /// This side disconnected or tore down before a response arrived.
    LocalDisconnect,
}

/// Continuation stored until its matching response or a terminal event.
pub type PromiseCallback = Box<dyn FnOnce(InvokeResult, Bytes) + Send + 'static>;

/// Anything that can carry a response frame back to a peer.
///
/// The seam the reply shield goes through: reply senders hold this weakly so
/// a reply arriving after engine teardown upgrades to nothing.
pub(crate) trait ResponseSink: Send + Sync {
    fn send_response(&self, connection: ConnectionId, request_id: RequestId, body: Bytes);
}

/// Handed to the reply-variant invoked handler; may travel to any thread and
/// outlive the connection that issued it.
///
/// Sending consumes the sender. After the connection is torn down, `send`
/// silently does nothing.
#[derive(Clone)]
pub struct ReplySender {
    sink: Weak<dyn ResponseSink>,
    connection: ConnectionId,
    request_id: RequestId,
}

impl ReplySender {
    pub(crate) fn new(
        sink: Weak<dyn ResponseSink>,
        connection: ConnectionId,
        request_id: RequestId,
    ) -> Self {
        Self {
            sink,
            connection,
            request_id,
        }
    }

    /// The request this reply answers.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Send the response body. A no-op once the connection is gone.
    pub fn send(self, body: impl Into<Bytes>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.send_response(self.connection, self.request_id, body.into());
        }
    }
}

impl std::fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySender")
            .field("connection", &self.connection)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Monotonic request-id source shared by all peers of one engine.
///
/// Ids are never 0 and never carry the response flag: on reaching the flag
/// bit the counter resets to 0 under the rollover mutex and allocation
/// continues from 1.
pub(crate) struct RequestIdAllocator {
    last: AtomicU32,
    rollover: Mutex<()>,
}

impl RequestIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            last: AtomicU32::new(0),
            rollover: Mutex::new(()),
        }
    }

    pub(crate) fn next(&self) -> RequestId {
        let mut id = self.last.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if id >= RESPONSE_FLAG {
            let _guard = self.rollover.lock().unwrap();
            if self.last.load(Ordering::Acquire) >= RESPONSE_FLAG {
                self.last.store(0, Ordering::Release);
            }
            id = self.last.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_request_ids_start_at_one() {
        let allocator = RequestIdAllocator::new();
        assert_eq!(allocator.next(), 1);
        assert_eq!(allocator.next(), 2);
        assert_eq!(allocator.next(), 3);
    }

    #[test]
    fn test_request_ids_roll_over_before_response_flag() {
        let allocator = RequestIdAllocator::new();
        allocator.last.store(RESPONSE_FLAG - 2, Ordering::Release);

        let id = allocator.next();
        assert_eq!(id, RESPONSE_FLAG - 1);

        // Next allocation would reach the flag bit; it must wrap to 1.
        let id = allocator.next();
        assert_eq!(id, 1);
        assert_eq!(allocator.next(), 2);
    }

    #[test]
    fn test_request_ids_never_zero_or_flagged() {
        let allocator = RequestIdAllocator::new();
        allocator.last.store(RESPONSE_FLAG - 5, Ordering::Release);
        for _ in 0..20 {
            let id = allocator.next();
            assert_ne!(id, 0);
            assert_eq!(id & RESPONSE_FLAG, 0);
        }
    }

    #[test]
    fn test_reply_sender_after_sink_gone_is_noop() {
        struct Recorder;
        impl ResponseSink for Recorder {
            fn send_response(&self, _: ConnectionId, _: RequestId, _: Bytes) {
                panic!("must not be called");
            }
        }

        let sink: Arc<dyn ResponseSink> = Arc::new(Recorder);
        let reply = ReplySender::new(Arc::downgrade(&sink), 1, 7);
        drop(sink);

        reply.send(Bytes::from_static(b"late"));
    }

    #[test]
    fn test_reply_sender_routes_to_sink() {
        struct Recorder(Mutex<Vec<(ConnectionId, RequestId, Bytes)>>);
        impl ResponseSink for Recorder {
            fn send_response(&self, c: ConnectionId, r: RequestId, b: Bytes) {
                self.0.lock().unwrap().push((c, r, b));
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sink: Arc<dyn ResponseSink> = recorder.clone();
        let reply = ReplySender::new(Arc::downgrade(&sink), 3, 9);
        reply.send(Bytes::from_static(b"pong"));

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        assert_eq!(calls[0].1, 9);
        assert_eq!(calls[0].2, Bytes::from_static(b"pong"));
    }
}
