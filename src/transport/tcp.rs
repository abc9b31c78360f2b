//! TCP loopback transport.

use std::io;
use std::net::SocketAddrV4;

use tokio::net::{TcpListener, TcpStream};

use super::BoxedStream;

/// TCP listener wrapper matching the pipe listener surface.
pub(crate) struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> io::Result<BoxedStream> {
        let (stream, _addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Dial a TCP endpoint.
pub(crate) async fn connect(addr: SocketAddrV4) -> io::Result<BoxedStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}
