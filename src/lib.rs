//! # pipelink
//!
//! Bidirectional framed IPC between local processes with request/response
//! ("invoke") semantics, over named pipes (Unix-domain sockets / Windows
//! named pipes) or TCP loopback.
//!
//! ## Architecture
//!
//! - One transport thread per connection owns the event loop: dialing or
//!   accepting, framing, and the cross-thread write queue.
//! - One delivery thread per connection serializes every user callback.
//! - Frames are an 8-byte header (`request_id`, `body_size`, little-endian)
//!   plus an opaque body. The high bit of `request_id` marks responses.
//!
//! ## Example
//!
//! ```ignore
//! use pipelink::{new_client_connection, new_server_connection, InvokeResult};
//!
//! let server = new_server_connection("demo-endpoint", false);
//! server.on_invoked_immediate(|body| body); // echo
//! server.connect();
//!
//! let client = new_client_connection("demo-endpoint");
//! client.connect();
//! client.invoke_with_callback("ping", |result, body| {
//!     assert_eq!(result, InvokeResult::Good);
//!     assert_eq!(&body[..], b"ping");
//! });
//! ```

mod connection;
mod delivery;
mod factory;
mod logging;

pub mod error;
pub mod protocol;

pub(crate) mod transport;

pub use connection::{
    ClientConnection, InvokeResult, PromiseCallback, ReplySender, ServerConnection,
    SingleServerConnection,
};
pub use error::{PipelinkError, Result};
pub use factory::{
    new_client_connection, new_multi_server_connection, new_server_connection,
    new_tcp_client_connection, new_tcp_multi_server_connection, new_tcp_server_connection,
};
pub use logging::LogLevel;
pub use protocol::{ConnectionId, RequestId};
