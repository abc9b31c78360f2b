//! Multi-peer server connection engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use super::{
    InvokeResult, PromiseCallback, ReplySender, RequestIdAllocator, ResponseSink,
    CONNECTION_CATEGORY, TRANSPORT_CATEGORY,
};
use crate::delivery::DeliveryQueue;
use crate::error::Result;
use crate::factory::TransportKind;
use crate::logging::{LevelCell, LogLevel, SharedLevel};
use crate::protocol::{ConnectionId, RequestId, RESPONSE_FLAG};
use crate::transport::endpoint::{parse_tcp_endpoint, Role};
use crate::transport::server::{ListenerSpec, ServerTransport};
use crate::transport::{TransportEvents, TransportOptions};

type LogHandler = Arc<dyn Fn(ConnectionId, LogLevel, String, String) + Send + Sync>;

/// The single active `on_invoked` variant. Setting one clears the others.
#[derive(Clone, Default)]
enum InvokedHandler {
    #[default]
    None,
    PromiseId(Arc<dyn Fn(ConnectionId, RequestId, Bytes) + Send + Sync>),
    Immediate(Arc<dyn Fn(ConnectionId, Bytes) -> Bytes + Send + Sync>),
    Reply(Arc<dyn Fn(ConnectionId, Bytes, ReplySender) + Send + Sync>),
}

#[derive(Clone, Default)]
struct Handlers {
    received: Option<Arc<dyn Fn(ConnectionId, Bytes) + Send + Sync>>,
    invoked: InvokedHandler,
    result: Option<Arc<dyn Fn(ConnectionId, RequestId, Bytes) + Send + Sync>>,
    connect: Option<Arc<dyn Fn(ConnectionId) + Send + Sync>>,
    disconnect: Option<Arc<dyn Fn(ConnectionId) + Send + Sync>>,
    error: Option<Arc<dyn Fn(ConnectionId) + Send + Sync>>,
    log: Option<LogHandler>,
}

struct Shared {
    /// Self-reference for hooks, delivery jobs, and reply senders; they all
    /// hold the engine weakly so teardown is never kept alive from outside.
    weak_self: Weak<Shared>,
    endpoint: String,
    kind: TransportKind,
    latest_only: bool,
    allow_multiuser_access: bool,
    transport: Mutex<Option<ServerTransport>>,
    shutting_down: AtomicBool,
    callbacks: Mutex<HashMap<ConnectionId, HashMap<RequestId, PromiseCallback>>>,
    handlers: Mutex<Handlers>,
    delivery: DeliveryQueue,
    request_ids: RequestIdAllocator,
    log_level: SharedLevel,
}

/// A server endpoint accepting any number of peers, each addressed by its
/// [`ConnectionId`].
///
/// All handler callbacks run on this connection's delivery thread, in the
/// order the transport observed the corresponding events.
pub struct ServerConnection {
    shared: Arc<Shared>,
}

impl ServerConnection {
    pub(crate) fn new(
        kind: TransportKind,
        endpoint: String,
        latest_only: bool,
        allow_multiuser_access: bool,
    ) -> Self {
        Self {
            shared: Arc::new_cyclic(|weak_self| Shared {
                weak_self: weak_self.clone(),
                endpoint,
                kind,
                latest_only,
                allow_multiuser_access,
                transport: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                callbacks: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Handlers::default()),
                delivery: DeliveryQueue::new(),
                request_ids: RequestIdAllocator::new(),
                log_level: LevelCell::new(LogLevel::None),
            }),
        }
    }

    /// Bind the endpoint and start accepting. Idempotent while listening; a
    /// no-op once shutting down. Blocks until bind+listen has completed; a
    /// bind failure is reported through `on_error` and the `Error` log.
    pub fn connect(&self) {
        let shared = &self.shared;
        shared.log(0, LogLevel::Info, || "`connect`".to_string());

        if shared.endpoint.is_empty() {
            shared.log(0, LogLevel::Error, || "no endpoint specified".to_string());
            return;
        }

        let mut slot = shared.transport.lock().unwrap();
        if slot.is_some() {
            shared.log(0, LogLevel::Debug, || {
                "`connect` called but already connected".to_string()
            });
            return;
        }
        if shared.shutting_down.load(Ordering::Acquire) {
            shared.log(0, LogLevel::Debug, || {
                "`connect` called but already shutting down".to_string()
            });
            return;
        }

        let spec = match shared.listener_spec() {
            Ok(spec) => spec,
            Err(e) => {
                shared.log(0, LogLevel::Error, || e.to_string());
                return;
            }
        };

        match ServerTransport::listen(
            spec,
            shared.latest_only,
            shared.transport_events(),
            TransportOptions::default(),
        ) {
            Ok(transport) => *slot = Some(transport),
            Err(e) => {
                let e = crate::error::PipelinkError::from(e);
                shared.log(0, LogLevel::Error, || format!("failed to start server: {e}"));
                shared.handle_error(0);
            }
        }
    }

    /// Tear the transport down and resolve every pending invoke, for every
    /// peer, with `LocalDisconnect`. Idempotent.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.log(0, LogLevel::Info, || "`disconnect`".to_string());

        {
            let mut slot = shared.transport.lock().unwrap();
            if shared.shutting_down.load(Ordering::Acquire) {
                return;
            }
            // Dropping inside the lock joins the loop thread before any new
            // connect() can start another one.
            drop(slot.take());
        }

        let callbacks = std::mem::take(&mut *shared.callbacks.lock().unwrap());
        for (_, peer_callbacks) in callbacks {
            for (_, callback) in peer_callbacks {
                callback(InvokeResult::LocalDisconnect, Bytes::new());
            }
        }
    }

    /// Number of currently-accepted peers.
    pub fn active_connections(&self) -> usize {
        let slot = self.shared.transport.lock().unwrap();
        match &*slot {
            Some(transport) if !self.shared.shutting_down.load(Ordering::Acquire) => {
                transport.active_connections()
            }
            _ => 0,
        }
    }

    /// Send a fire-and-forget message to every currently-accepted peer.
    pub fn broadcast(&self, body: impl Into<Bytes>) {
        let body = body.into();
        let slot = self.shared.transport.lock().unwrap();
        if let Some(transport) = &*slot {
            if !self.shared.shutting_down.load(Ordering::Acquire) {
                transport.broadcast(body);
            }
        }
    }

    /// Send a fire-and-forget message to one peer.
    pub fn send(&self, connection: ConnectionId, body: impl Into<Bytes>) {
        let body = body.into();
        let shared = &self.shared;
        shared.log(connection, LogLevel::Debug, || {
            format!("sending message of length {}", body.len())
        });

        let slot = shared.transport.lock().unwrap();
        if let Some(transport) = &*slot {
            if !shared.shutting_down.load(Ordering::Acquire) {
                transport.send(connection, 0, body);
            }
        }
    }

    /// Send a request to one peer, fire-and-collect style: the response
    /// arrives through `on_result` carrying the returned id.
    pub fn invoke(&self, connection: ConnectionId, body: impl Into<Bytes>) -> RequestId {
        let body = body.into();
        let shared = &self.shared;
        shared.log(connection, LogLevel::Debug, || {
            format!("sending invoke of length {}", body.len())
        });
        let request_id = shared.request_ids.next();

        let slot = shared.transport.lock().unwrap();
        if let Some(transport) = &*slot {
            if !shared.shutting_down.load(Ordering::Acquire) {
                transport.send(connection, request_id, body);
            }
        }
        request_id
    }

    /// Send a request to one peer; `callback` fires exactly once with the
    /// outcome. A peer unknown at send time resolves `RemoteDisconnect` as
    /// soon as the transport proves it unreachable.
    pub fn invoke_with_callback(
        &self,
        connection: ConnectionId,
        body: impl Into<Bytes>,
        callback: impl FnOnce(InvokeResult, Bytes) + Send + 'static,
    ) {
        let body = body.into();
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::Acquire) {
            return;
        }
        shared.log(connection, LogLevel::Debug, || {
            format!("sending invoke of length {}", body.len())
        });
        let request_id = shared.request_ids.next();

        let slot = shared.transport.lock().unwrap();
        match &*slot {
            Some(transport) => {
                shared
                    .callbacks
                    .lock()
                    .unwrap()
                    .entry(connection)
                    .or_default()
                    .insert(request_id, Box::new(callback));
                transport.send(connection, request_id, body);
            }
            None => {
                drop(slot);
                callback(InvokeResult::LocalDisconnect, Bytes::new());
            }
        }
    }

    /// Answer a request previously surfaced by the promise-id `on_invoked`
    /// variant.
    pub fn send_result(
        &self,
        connection: ConnectionId,
        request_id: RequestId,
        body: impl Into<Bytes>,
    ) {
        let body = body.into();
        let shared = &self.shared;
        shared.log(connection, LogLevel::Debug, || {
            format!("sending invoke result of length {}", body.len())
        });
        shared.send_response(connection, request_id, body);
    }

    /// Handler for fire-and-forget messages.
    pub fn on_received(&self, handler: impl Fn(ConnectionId, Bytes) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().received = Some(Arc::new(handler));
    }

    /// Promise-id variant: `(connection, request_id, body)`; reply later via
    /// [`send_result`](Self::send_result). Clears the other variants.
    pub fn on_invoked(
        &self,
        handler: impl Fn(ConnectionId, RequestId, Bytes) + Send + Sync + 'static,
    ) {
        self.shared.handlers.lock().unwrap().invoked =
            InvokedHandler::PromiseId(Arc::new(handler));
    }

    /// Immediate variant: the returned body is sent as the response. Clears
    /// the other variants.
    pub fn on_invoked_immediate(
        &self,
        handler: impl Fn(ConnectionId, Bytes) -> Bytes + Send + Sync + 'static,
    ) {
        self.shared.handlers.lock().unwrap().invoked =
            InvokedHandler::Immediate(Arc::new(handler));
    }

    /// Reply-sender variant: the handler answers through the sender, possibly
    /// from another thread, possibly never. Clears the other variants.
    pub fn on_invoked_reply(
        &self,
        handler: impl Fn(ConnectionId, Bytes, ReplySender) + Send + Sync + 'static,
    ) {
        self.shared.handlers.lock().unwrap().invoked = InvokedHandler::Reply(Arc::new(handler));
    }

    /// Remove whichever `on_invoked` variant is active.
    pub fn clear_invoked(&self) {
        self.shared.handlers.lock().unwrap().invoked = InvokedHandler::None;
    }

    /// Handler for responses whose invoke was issued without a callback.
    pub fn on_result(
        &self,
        handler: impl Fn(ConnectionId, RequestId, Bytes) + Send + Sync + 'static,
    ) {
        self.shared.handlers.lock().unwrap().result = Some(Arc::new(handler));
    }

    pub fn on_connect(&self, handler: impl Fn(ConnectionId) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn(ConnectionId) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().disconnect = Some(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(ConnectionId) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().error = Some(Arc::new(handler));
    }

    /// Install a log sink. A concrete `level` sets the minimum level;
    /// `LogLevel::None` keeps the current one, defaulting to `Warning` if
    /// none was ever set.
    pub fn on_log(
        &self,
        handler: impl Fn(ConnectionId, LogLevel, String, String) + Send + Sync + 'static,
        level: LogLevel,
    ) {
        if level != LogLevel::None {
            self.shared.log_level.set(level);
        } else if self.shared.log_level.get() == LogLevel::None {
            self.shared.log_level.set(LogLevel::Warning);
        }
        self.shared.handlers.lock().unwrap().log = Some(Arc::new(handler));
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.log_level.set(level);
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        let shared = &self.shared;
        {
            let _slot = shared.transport.lock().unwrap();
            shared.shutting_down.store(true, Ordering::Release);
        }
        shared.delivery.stop();
        {
            let mut slot = shared.transport.lock().unwrap();
            drop(slot.take());
        }

        let callbacks = std::mem::take(&mut *shared.callbacks.lock().unwrap());
        for (_, peer_callbacks) in callbacks {
            for (_, callback) in peer_callbacks {
                callback(InvokeResult::LocalDisconnect, Bytes::new());
            }
        }
    }
}

impl Shared {
    fn listener_spec(&self) -> Result<ListenerSpec> {
        match self.kind {
            TransportKind::Pipe => Ok(ListenerSpec::Pipe {
                path: self.endpoint.clone(),
                allow_multiuser_access: self.allow_multiuser_access,
            }),
            TransportKind::Tcp => Ok(ListenerSpec::Tcp(parse_tcp_endpoint(
                &self.endpoint,
                Role::Server,
            )?)),
        }
    }

    fn transport_events(&self) -> TransportEvents {
        let weak = self.weak_self.clone();

        let on_connect = {
            let weak = weak.clone();
            Box::new(move |connection| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_remote_connected(connection);
                }
            }) as Box<dyn Fn(ConnectionId) + Send + Sync>
        };
        let on_disconnect = {
            let weak = weak.clone();
            Box::new(move |connection| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_remote_disconnected(connection);
                }
            }) as Box<dyn Fn(ConnectionId) + Send + Sync>
        };
        let on_data = {
            let weak = weak.clone();
            Box::new(move |connection, request_id, body| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_data(connection, request_id, body);
                }
            }) as Box<dyn Fn(ConnectionId, RequestId, Bytes) + Send + Sync>
        };
        let on_no_peer_for_request = {
            let weak = weak.clone();
            Box::new(move |connection, request_id| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_no_peer_for_request(connection, request_id);
                }
            }) as Box<dyn Fn(ConnectionId, RequestId) + Send + Sync>
        };
        let on_error = {
            let weak = weak.clone();
            Box::new(move |connection| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_error(connection);
                }
            }) as Box<dyn Fn(ConnectionId) + Send + Sync>
        };
        let on_log = {
            let weak = weak.clone();
            Box::new(move |connection, level, message| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_log(connection, level, message, TRANSPORT_CATEGORY);
                }
            }) as Box<dyn Fn(ConnectionId, LogLevel, String) + Send + Sync>
        };

        TransportEvents {
            on_connect,
            on_disconnect,
            on_data,
            on_no_peer_for_request,
            on_error,
            on_log,
            log_level: self.log_level.clone(),
        }
    }

    fn handle_remote_connected(&self, connection: ConnectionId) {
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            let handler = shared.handlers.lock().unwrap().connect.clone();
            if let Some(handler) = handler {
                handler(connection);
            }
        });
    }

    fn handle_remote_disconnected(&self, connection: ConnectionId) {
        if self.shutting_down.load(Ordering::Acquire) {
            // Teardown resolves the callbacks itself; taking them here would
            // hand them to a delivery queue that no longer runs jobs.
            return;
        }
        // Pull this peer's invoke callbacks out now so nothing re-registers
        // between here and the delivery job running.
        let expired = self
            .callbacks
            .lock()
            .unwrap()
            .remove(&connection)
            .unwrap_or_default();

        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            for (_, callback) in expired {
                callback(InvokeResult::RemoteDisconnect, Bytes::new());
            }
            let Some(shared) = weak.upgrade() else { return };
            let handler = shared.handlers.lock().unwrap().disconnect.clone();
            if let Some(handler) = handler {
                handler(connection);
            }
        });
    }

    /// A queued request frame found its peer already gone.
    fn handle_no_peer_for_request(&self, connection: ConnectionId, request_id: u32) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let callback = {
            let mut callbacks = self.callbacks.lock().unwrap();
            match callbacks.get_mut(&connection) {
                Some(peer_callbacks) => peer_callbacks.remove(&request_id),
                None => None,
            }
        };
        if let Some(callback) = callback {
            self.log(connection, LogLevel::Debug, || {
                "rejecting invoke for missing client".to_string()
            });
            self.delivery.enqueue(move || {
                callback(InvokeResult::RemoteDisconnect, Bytes::new());
            });
        }
    }

    fn handle_data(&self, connection: ConnectionId, request_id: u32, body: Bytes) {
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            shared.dispatch(connection, request_id, body);
        });
    }

    /// Dispatch policy for one incoming frame; runs on the delivery thread.
    fn dispatch(&self, connection: ConnectionId, request_id: u32, body: Bytes) {
        if request_id == 0 {
            let handler = self.handlers.lock().unwrap().received.clone();
            if let Some(handler) = handler {
                handler(connection, body);
            }
        } else if request_id & RESPONSE_FLAG != 0 {
            let promise_id = request_id & !RESPONSE_FLAG;
            let callback = {
                let mut callbacks = self.callbacks.lock().unwrap();
                match callbacks.get_mut(&connection) {
                    Some(peer_callbacks) => peer_callbacks.remove(&promise_id),
                    None => None,
                }
            };
            if let Some(callback) = callback {
                self.log(connection, LogLevel::Debug, || {
                    format!(
                        "processing invoke result {} of length {}",
                        promise_id,
                        body.len()
                    )
                });
                callback(InvokeResult::Good, body);
                return;
            }
            let handler = self.handlers.lock().unwrap().result.clone();
            if let Some(handler) = handler {
                handler(connection, promise_id, body);
            } else {
                self.log(connection, LogLevel::Debug, || {
                    format!("could not process invoke result {}", promise_id)
                });
            }
        } else {
            let promise_id = request_id;
            self.log(connection, LogLevel::Debug, || {
                format!(
                    "received invoke request {} of length {}",
                    promise_id,
                    body.len()
                )
            });
            let invoked = self.handlers.lock().unwrap().invoked.clone();
            match invoked {
                InvokedHandler::PromiseId(handler) => handler(connection, promise_id, body),
                InvokedHandler::Immediate(handler) => {
                    let result = handler(connection, body);
                    self.send_response(connection, promise_id, result);
                }
                InvokedHandler::Reply(handler) => {
                    let sink: Weak<dyn ResponseSink> = self.weak_self.clone();
                    handler(connection, body, ReplySender::new(sink, connection, promise_id));
                }
                InvokedHandler::None => {}
            }
        }
    }

    fn handle_error(&self, connection: ConnectionId) {
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            let handler = shared.handlers.lock().unwrap().error.clone();
            if let Some(handler) = handler {
                handler(connection);
            }
        });
    }

    fn handle_log(
        &self,
        connection: ConnectionId,
        level: LogLevel,
        message: String,
        category: &'static str,
    ) {
        if self.handlers.lock().unwrap().log.is_none() || !self.log_level.enabled(level) {
            return;
        }
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            // Level may have changed since this was enqueued.
            if !shared.log_level.enabled(level) {
                return;
            }
            let handler = shared.handlers.lock().unwrap().log.clone();
            if let Some(handler) = handler {
                handler(connection, level, message, category.to_string());
            }
        });
    }

    fn log<F: FnOnce() -> String>(
        &self,
        connection: ConnectionId,
        level: LogLevel,
        message: F,
    ) {
        if self.log_level.enabled(level) {
            self.handle_log(connection, level, message(), CONNECTION_CATEGORY);
        }
    }
}

impl ResponseSink for Shared {
    fn send_response(&self, connection: ConnectionId, request_id: RequestId, body: Bytes) {
        let slot = self.transport.lock().unwrap();
        if let Some(transport) = &*slot {
            if !self.shutting_down.load(Ordering::Acquire) {
                transport.send(connection, request_id | RESPONSE_FLAG, body);
            }
        }
    }
}
