//! Client connection engine.

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
use crate::protocol::{RequestId, RESPONSE_FLAG};
use crate::transport::client::{ClientTransport, Dialer};
use crate::transport::endpoint::{parse_tcp_endpoint, Role};
use crate::transport::{TransportEvents, TransportOptions};

type LogHandler = Arc<dyn Fn(LogLevel, String, String) + Send + Sync>;

/// The single active `on_invoked` variant. Setting one clears the others.
#[derive(Clone, Default)]
enum InvokedHandler {
    #[default]
    None,
    /// User replies later through `send_result`.
    PromiseId(Arc<dyn Fn(RequestId, Bytes) + Send + Sync>),
    /// Return value is sent back as the response.
    Immediate(Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>),
    /// User replies through the handed-out [`ReplySender`].
    Reply(Arc<dyn Fn(Bytes, ReplySender) + Send + Sync>),
}

#[derive(Clone, Default)]
struct Handlers {
    received: Option<Arc<dyn Fn(Bytes) + Send + Sync>>,
    invoked: InvokedHandler,
    result: Option<Arc<dyn Fn(RequestId, Bytes) + Send + Sync>>,
    connect: Option<Arc<dyn Fn() + Send + Sync>>,
    disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    error: Option<Arc<dyn Fn() + Send + Sync>>,
    log: Option<LogHandler>,
}

struct Shared {
    /// Self-reference for hooks, delivery jobs, and reply senders; they all
    /// hold the engine weakly so teardown is never kept alive from outside.
    weak_self: Weak<Shared>,
    endpoint: String,
    kind: TransportKind,
    transport: Mutex<Option<ClientTransport>>,
    shutting_down: AtomicBool,
    /// Set by `disconnect()`, cleared by `connect()`: invokes in between fail
    /// fast with `LocalDisconnect` instead of queueing.
    disconnected: AtomicBool,
    callbacks: Mutex<HashMap<RequestId, PromiseCallback>>,
    /// Frames accepted before the first `connect()`, flushed by it.
    queued: Mutex<Vec<(RequestId, Bytes)>>,
    handlers: Mutex<Handlers>,
    delivery: DeliveryQueue,
    request_ids: RequestIdAllocator,
    log_level: SharedLevel,
}

/// A client endpoint: dials the server, reconnects on remote close, and
/// correlates invoke responses.
///
/// All handler callbacks run on this connection's delivery thread, in the
/// order the transport observed the corresponding events.
pub struct ClientConnection {
    shared: Arc<Shared>,
}

impl ClientConnection {
    pub(crate) fn new(kind: TransportKind, endpoint: String) -> Self {
        Self {
            shared: Arc::new_cyclic(|weak_self| Shared {
                weak_self: weak_self.clone(),
                endpoint,
                kind,
                transport: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                callbacks: Mutex::new(HashMap::new()),
                queued: Mutex::new(Vec::new()),
                handlers: Mutex::new(Handlers::default()),
                delivery: DeliveryQueue::new(),
                request_ids: RequestIdAllocator::new(),
                log_level: LevelCell::new(LogLevel::None),
            }),
        }
    }

    /// Start the transport and begin dialing. Idempotent while connected;
    /// a no-op once shutting down. Blocks until the first dial attempt is
    /// under way, then returns; progress is reported through `on_connect`.
    pub fn connect(&self) {
        let shared = &self.shared;
        shared.log(LogLevel::Info, || "`connect`".to_string());

        if shared.endpoint.is_empty() {
            shared.log(LogLevel::Error, || "no endpoint specified".to_string());
            return;
        }

        let mut slot = shared.transport.lock().unwrap();
        if slot.is_some() {
            shared.log(LogLevel::Debug, || {
                "`connect` called but already connected".to_string()
            });
            return;
        }
        if shared.shutting_down.load(Ordering::Acquire) {
            shared.log(LogLevel::Debug, || {
                "`connect` called but already shutting down".to_string()
            });
            return;
        }

        let dialer = match shared.dialer() {
            Ok(dialer) => dialer,
            Err(e) => {
                shared.log(LogLevel::Error, || e.to_string());
                return;
            }
        };

        let transport = ClientTransport::start(
            dialer,
            shared.transport_events(),
            TransportOptions::default(),
        );

        for (request_id, body) in shared.queued.lock().unwrap().drain(..) {
            transport.send(0, request_id, body);
        }

        *slot = Some(transport);
        shared.disconnected.store(false, Ordering::Release);
    }

    /// Tear the transport down and resolve every pending invoke with
    /// `LocalDisconnect`. Idempotent.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.log(LogLevel::Info, || "`disconnect`".to_string());

        {
            let mut slot = shared.transport.lock().unwrap();
            if shared.shutting_down.load(Ordering::Acquire) {
                return;
            }
            shared.disconnected.store(true, Ordering::Release);
            // Dropping inside the lock joins the loop thread before any new
            // connect() can start another one.
            drop(slot.take());
        }
        shared.queued.lock().unwrap().clear();

        let callbacks = std::mem::take(&mut *shared.callbacks.lock().unwrap());
        for (_, callback) in callbacks {
            callback(InvokeResult::LocalDisconnect, Bytes::new());
        }
    }

    /// Send a fire-and-forget message (no reply expected).
    pub fn send(&self, body: impl Into<Bytes>) {
        let body = body.into();
        let shared = &self.shared;
        shared.log(LogLevel::Debug, || {
            format!("sending message of length {}", body.len())
        });

        let slot = shared.transport.lock().unwrap();
        if shared.shutting_down.load(Ordering::Acquire) {
            return;
        }
        match &*slot {
            Some(transport) => transport.send(0, 0, body),
            None if !shared.disconnected.load(Ordering::Acquire) => {
                shared.queued.lock().unwrap().push((0, body));
            }
            None => {}
        }
    }

    /// Send a request, fire-and-collect style: the response arrives through
    /// `on_result` carrying the returned id.
    pub fn invoke(&self, body: impl Into<Bytes>) -> RequestId {
        let body = body.into();
        let shared = &self.shared;
        let request_id = shared.request_ids.next();
        shared.log(LogLevel::Debug, || {
            format!("sending invoke of length {}", body.len())
        });

        let slot = shared.transport.lock().unwrap();
        if !shared.shutting_down.load(Ordering::Acquire) {
            match &*slot {
                Some(transport) => transport.send(0, request_id, body),
                None if !shared.disconnected.load(Ordering::Acquire) => {
                    shared.queued.lock().unwrap().push((request_id, body));
                }
                None => {}
            }
        }
        request_id
    }

    /// Send a request; `callback` fires exactly once with the outcome.
    ///
    /// Accepted even before the first `connect()` — the frame is held and
    /// flushed on connect. After `disconnect()` the callback resolves
    /// immediately with `LocalDisconnect`.
    pub fn invoke_with_callback(
        &self,
        body: impl Into<Bytes>,
        callback: impl FnOnce(InvokeResult, Bytes) + Send + 'static,
    ) {
        let body = body.into();
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let request_id = shared.request_ids.next();
        shared.log(LogLevel::Debug, || {
            format!("sending invoke of length {}", body.len())
        });

        let slot = shared.transport.lock().unwrap();
        match &*slot {
            Some(transport) => {
                shared
                    .callbacks
                    .lock()
                    .unwrap()
                    .insert(request_id, Box::new(callback));
                transport.send(0, request_id, body);
            }
            None if !shared.disconnected.load(Ordering::Acquire) => {
                shared
                    .callbacks
                    .lock()
                    .unwrap()
                    .insert(request_id, Box::new(callback));
                shared.queued.lock().unwrap().push((request_id, body));
            }
            None => {
                drop(slot);
                callback(InvokeResult::LocalDisconnect, Bytes::new());
            }
        }
    }

    /// Answer a request previously surfaced by the promise-id `on_invoked`
    /// variant.
    pub fn send_result(&self, request_id: RequestId, body: impl Into<Bytes>) {
        let body = body.into();
        let shared = &self.shared;
        shared.log(LogLevel::Debug, || {
            format!(
                "sending invoke result {} of length {}",
                request_id,
                body.len()
            )
        });
        shared.send_response(0, request_id, body);
    }

    /// Handler for fire-and-forget messages.
    pub fn on_received(&self, handler: impl Fn(Bytes) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().received = Some(Arc::new(handler));
    }

    /// Promise-id variant: `(request_id, body)`; reply later via
    /// [`send_result`](Self::send_result). Clears the other variants.
    pub fn on_invoked(&self, handler: impl Fn(RequestId, Bytes) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().invoked =
            InvokedHandler::PromiseId(Arc::new(handler));
    }

    /// Immediate variant: the returned body is sent as the response. Clears
    /// the other variants.
    pub fn on_invoked_immediate(&self, handler: impl Fn(Bytes) -> Bytes + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().invoked =
            InvokedHandler::Immediate(Arc::new(handler));
    }

    /// Reply-sender variant: the handler answers through the sender, possibly
    /// from another thread, possibly never. Clears the other variants.
    pub fn on_invoked_reply(
        &self,
        handler: impl Fn(Bytes, ReplySender) + Send + Sync + 'static,
    ) {
        self.shared.handlers.lock().unwrap().invoked = InvokedHandler::Reply(Arc::new(handler));
    }

    /// Remove whichever `on_invoked` variant is active.
    pub fn clear_invoked(&self) {
        self.shared.handlers.lock().unwrap().invoked = InvokedHandler::None;
    }

    /// Handler for responses whose invoke was issued without a callback.
    pub fn on_result(&self, handler: impl Fn(RequestId, Bytes) + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().result = Some(Arc::new(handler));
    }

    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().disconnect = Some(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.handlers.lock().unwrap().error = Some(Arc::new(handler));
    }

    /// Install a log sink. A concrete `level` sets the minimum level;
    /// `LogLevel::None` keeps the current one, defaulting to `Warning` if
    /// none was ever set.
    pub fn on_log(
        &self,
        handler: impl Fn(LogLevel, String, String) + Send + Sync + 'static,
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

impl Drop for ClientConnection {
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
        for (_, callback) in callbacks {
            callback(InvokeResult::LocalDisconnect, Bytes::new());
        }
    }
}

impl Shared {
    fn dialer(&self) -> Result<Dialer> {
        match self.kind {
            TransportKind::Pipe => Ok(Dialer::Pipe(self.endpoint.clone())),
            TransportKind::Tcp => Ok(Dialer::Tcp(parse_tcp_endpoint(
                &self.endpoint,
                Role::Client,
            )?)),
        }
    }

    /// Wire the transport hooks. Each holds the engine weakly: a hook firing
    /// during teardown upgrades to nothing and drops the event.
    fn transport_events(&self) -> TransportEvents {
        let weak = self.weak_self.clone();

        let on_connect = {
            let weak = weak.clone();
            Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_remote_connected();
                }
            }) as Box<dyn Fn(u32) + Send + Sync>
        };
        let on_disconnect = {
            let weak = weak.clone();
            Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_remote_disconnected();
                }
            }) as Box<dyn Fn(u32) + Send + Sync>
        };
        let on_data = {
            let weak = weak.clone();
            Box::new(move |_, request_id, body| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_data(request_id, body);
                }
            }) as Box<dyn Fn(u32, RequestId, Bytes) + Send + Sync>
        };
        let on_error = {
            let weak = weak.clone();
            Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_error();
                }
            }) as Box<dyn Fn(u32) + Send + Sync>
        };
        let on_log = {
            let weak = weak.clone();
            Box::new(move |_, level, message| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_log(level, message, TRANSPORT_CATEGORY);
                }
            }) as Box<dyn Fn(u32, LogLevel, String) + Send + Sync>
        };

        TransportEvents {
            on_connect,
            on_disconnect,
            on_data,
            on_no_peer_for_request: Box::new(|_, _| {}),
            on_error,
            on_log,
            log_level: self.log_level.clone(),
        }
    }

    fn handle_remote_connected(&self) {
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            let handler = shared.handlers.lock().unwrap().connect.clone();
            if let Some(handler) = handler {
                handler();
            }
        });
    }

    fn handle_remote_disconnected(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            // Teardown resolves the callbacks itself; taking them here would
            // hand them to a delivery queue that no longer runs jobs.
            return;
        }
        // Pull expired invoke callbacks out now so nothing re-registers
        // between here and the delivery job running.
        let expired = std::mem::take(&mut *self.callbacks.lock().unwrap());

        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            for (_, callback) in expired {
                callback(InvokeResult::RemoteDisconnect, Bytes::new());
            }
            let Some(shared) = weak.upgrade() else { return };
            let handler = shared.handlers.lock().unwrap().disconnect.clone();
            if let Some(handler) = handler {
                handler();
            }
        });
    }

    fn handle_data(&self, request_id: u32, body: Bytes) {
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            shared.dispatch(request_id, body);
        });
    }

    /// Dispatch policy for one incoming frame; runs on the delivery thread.
    fn dispatch(&self, request_id: u32, body: Bytes) {
        if request_id == 0 {
            let handler = self.handlers.lock().unwrap().received.clone();
            if let Some(handler) = handler {
                handler(body);
            }
        } else if request_id & RESPONSE_FLAG != 0 {
            let promise_id = request_id & !RESPONSE_FLAG;
            let callback = self.callbacks.lock().unwrap().remove(&promise_id);
            if let Some(callback) = callback {
                self.log(LogLevel::Debug, || {
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
                handler(promise_id, body);
            } else {
                self.log(LogLevel::Debug, || {
                    format!("could not process invoke result {}", promise_id)
                });
            }
        } else {
            let promise_id = request_id;
            self.log(LogLevel::Debug, || {
                format!(
                    "received invoke request {} of length {}",
                    promise_id,
                    body.len()
                )
            });
            let invoked = self.handlers.lock().unwrap().invoked.clone();
            match invoked {
                InvokedHandler::PromiseId(handler) => handler(promise_id, body),
                InvokedHandler::Immediate(handler) => {
                    let result = handler(body);
                    self.send_response(0, promise_id, result);
                }
                InvokedHandler::Reply(handler) => {
                    let sink: Weak<dyn ResponseSink> = self.weak_self.clone();
                    handler(body, ReplySender::new(sink, 0, promise_id));
                }
                InvokedHandler::None => {}
            }
        }
    }

    fn handle_error(&self) {
        let weak = self.weak_self.clone();
        self.delivery.enqueue(move || {
            let Some(shared) = weak.upgrade() else { return };
            let handler = shared.handlers.lock().unwrap().error.clone();
            if let Some(handler) = handler {
                handler();
            }
        });
    }

    fn handle_log(&self, level: LogLevel, message: String, category: &'static str) {
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
                handler(level, message, category.to_string());
            }
        });
    }

    fn log<F: FnOnce() -> String>(&self, level: LogLevel, message: F) {
        if self.log_level.enabled(level) {
            self.handle_log(level, message(), CONNECTION_CATEGORY);
        }
    }
}

impl ResponseSink for Shared {
    fn send_response(&self, _connection: u32, request_id: RequestId, body: Bytes) {
        let slot = self.transport.lock().unwrap();
        if let Some(transport) = &*slot {
            if !self.shutting_down.load(Ordering::Acquire) {
                transport.send(0, request_id | RESPONSE_FLAG, body);
            }
        }
    }
}
