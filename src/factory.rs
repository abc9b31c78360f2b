//! Constructors wiring endpoint, transport kind, and engine together.

use crate::connection::{ClientConnection, ServerConnection, SingleServerConnection};
use crate::transport::endpoint::pipe_path_for_endpoint;

/// Which transport medium a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    Pipe,
    Tcp,
}

/// Client over a local named pipe. `endpoint` is a bare name, mapped to
/// `\\.\pipe\<name>` on Windows and `/tmp/<name>` on Unix.
pub fn new_client_connection(endpoint: &str) -> ClientConnection {
    ClientConnection::new(TransportKind::Pipe, pipe_path_for_endpoint(endpoint))
}

/// Single-peer server over a local named pipe.
///
/// `allow_multiuser_access` opens the pipe up to read+write for every local
/// user; the default keeps it owner read/write.
pub fn new_server_connection(endpoint: &str, allow_multiuser_access: bool) -> SingleServerConnection {
    SingleServerConnection::new(
        TransportKind::Pipe,
        pipe_path_for_endpoint(endpoint),
        allow_multiuser_access,
    )
}

/// Multi-peer server over a local named pipe.
pub fn new_multi_server_connection(
    endpoint: &str,
    allow_multiuser_access: bool,
) -> ServerConnection {
    ServerConnection::new(
        TransportKind::Pipe,
        pipe_path_for_endpoint(endpoint),
        false,
        allow_multiuser_access,
    )
}

/// Client over TCP loopback. `endpoint` is `"addr:port"`; an empty addr
/// means `127.0.0.1`.
pub fn new_tcp_client_connection(endpoint: &str) -> ClientConnection {
    ClientConnection::new(TransportKind::Tcp, endpoint.to_string())
}

/// Single-peer server over TCP. `endpoint` is `"addr:port"`; an empty addr
/// means `0.0.0.0`.
pub fn new_tcp_server_connection(endpoint: &str) -> SingleServerConnection {
    SingleServerConnection::new(TransportKind::Tcp, endpoint.to_string(), false)
}

/// Multi-peer server over TCP.
pub fn new_tcp_multi_server_connection(endpoint: &str) -> ServerConnection {
    ServerConnection::new(TransportKind::Tcp, endpoint.to_string(), false, false)
}
