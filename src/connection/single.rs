//! Single-peer server facade.
//!
//! A convenience wrapper over [`ServerConnection`] in latest-only accept
//! mode: it latches the most recently accepted peer and filters out events
//! from any other, so the API reads like the client's (no `ConnectionId`
//! anywhere). On-wire behavior is identical to the multi-server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::{InvokeResult, ReplySender, ServerConnection};
use crate::factory::TransportKind;
use crate::logging::LogLevel;
use crate::protocol::{ConnectionId, RequestId};

/// A server endpoint that talks to one peer at a time: a newly accepted peer
/// replaces the previous one.
pub struct SingleServerConnection {
    inner: ServerConnection,
    latched: Arc<AtomicU32>,
}

impl SingleServerConnection {
    pub(crate) fn new(kind: TransportKind, endpoint: String, allow_multiuser_access: bool) -> Self {
        let inner = ServerConnection::new(kind, endpoint, true, allow_multiuser_access);
        let latched = Arc::new(AtomicU32::new(0));

        let latch = latched.clone();
        inner.on_connect(move |connection| {
            latch.store(connection, Ordering::Release);
        });

        Self { inner, latched }
    }

    fn current(&self) -> ConnectionId {
        self.latched.load(Ordering::Acquire)
    }

    /// See [`ServerConnection::connect`].
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// See [`ServerConnection::disconnect`].
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Send a fire-and-forget message to the latched peer, if any.
    pub fn send(&self, body: impl Into<Bytes>) {
        let connection = self.current();
        if connection != 0 {
            self.inner.send(connection, body);
        }
    }

    /// Invoke on the latched peer. Returns 0 when no peer is latched.
    pub fn invoke(&self, body: impl Into<Bytes>) -> RequestId {
        let connection = self.current();
        if connection != 0 {
            self.inner.invoke(connection, body)
        } else {
            0
        }
    }

    /// Invoke on the latched peer with a completion callback. Dropped unseen
    /// when no peer is latched.
    pub fn invoke_with_callback(
        &self,
        body: impl Into<Bytes>,
        callback: impl FnOnce(InvokeResult, Bytes) + Send + 'static,
    ) {
        let connection = self.current();
        if connection != 0 {
            self.inner.invoke_with_callback(connection, body, callback);
        }
    }

    /// Answer a request surfaced by the promise-id `on_invoked` variant.
    pub fn send_result(&self, request_id: RequestId, body: impl Into<Bytes>) {
        let connection = self.current();
        if connection != 0 {
            self.inner.send_result(connection, request_id, body);
        }
    }

    /// Handler for fire-and-forget messages from the latched peer.
    pub fn on_received(&self, handler: impl Fn(Bytes) + Send + Sync + 'static) {
        let latch = self.latched.clone();
        self.inner.on_received(move |connection, body| {
            let current = latch.load(Ordering::Acquire);
            if current != 0 && current == connection {
                handler(body);
            }
        });
    }

    /// Promise-id `on_invoked` variant; see [`ServerConnection::on_invoked`].
    pub fn on_invoked(&self, handler: impl Fn(RequestId, Bytes) + Send + Sync + 'static) {
        let latch = self.latched.clone();
        self.inner.on_invoked(move |connection, request_id, body| {
            let current = latch.load(Ordering::Acquire);
            if current != 0 && current == connection {
                handler(request_id, body);
            }
        });
    }

    /// Immediate `on_invoked` variant; a foreign peer's request is answered
    /// with an empty body.
    pub fn on_invoked_immediate(&self, handler: impl Fn(Bytes) -> Bytes + Send + Sync + 'static) {
        let latch = self.latched.clone();
        self.inner.on_invoked_immediate(move |connection, body| {
            let current = latch.load(Ordering::Acquire);
            if current != 0 && current == connection {
                handler(body)
            } else {
                Bytes::new()
            }
        });
    }

    /// Reply-sender `on_invoked` variant.
    pub fn on_invoked_reply(
        &self,
        handler: impl Fn(Bytes, ReplySender) + Send + Sync + 'static,
    ) {
        let latch = self.latched.clone();
        self.inner.on_invoked_reply(move |connection, body, reply| {
            let current = latch.load(Ordering::Acquire);
            if current != 0 && current == connection {
                handler(body, reply);
            }
        });
    }

    /// Remove whichever `on_invoked` variant is active.
    pub fn clear_invoked(&self) {
        self.inner.clear_invoked();
    }

    /// Handler for responses whose invoke was issued without a callback.
    pub fn on_result(&self, handler: impl Fn(RequestId, Bytes) + Send + Sync + 'static) {
        let latch = self.latched.clone();
        self.inner.on_result(move |connection, request_id, body| {
            let current = latch.load(Ordering::Acquire);
            if current != 0 && current == connection {
                handler(request_id, body);
            }
        });
    }

    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) {
        let latch = self.latched.clone();
        self.inner.on_connect(move |connection| {
            latch.store(connection, Ordering::Release);
            handler();
        });
    }

    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.on_disconnect(move |_| handler());
    }

    pub fn on_error(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.on_error(move |_| handler());
    }

    /// Install a log sink; see [`ServerConnection::on_log`].
    pub fn on_log(
        &self,
        handler: impl Fn(LogLevel, String, String) + Send + Sync + 'static,
        level: LogLevel,
    ) {
        self.inner
            .on_log(move |_, lvl, message, category| handler(lvl, message, category), level);
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.set_log_level(level);
    }
}
