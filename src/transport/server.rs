//! Server transport loop.
//!
//! One OS thread per server connection: binds the endpoint, accepts peers,
//! spawns a reader and a writer task per peer on the same loop thread, and
//! drains the cross-thread write queue. Queued request frames whose target
//! peer has vanished are reported through `on_no_peer_for_request` so the
//! engine can fail the pending callback instead of leaking it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::client::is_disconnect_error;
use super::pipe::PipeListener;
use super::tcp::TcpAcceptor;
use super::writer::{spawn_frame_writer, FrameWriterHandle, OutboundFrame};
use super::{next_connection_id, BoxedStream, TransportEvents, TransportOptions, WriteCommand};
use crate::logging::LogLevel;
use crate::protocol::{ConnectionId, FrameBuffer, RequestId, RESPONSE_FLAG};

/// Where the server binds.
pub(crate) enum ListenerSpec {
    Pipe {
        path: String,
        allow_multiuser_access: bool,
    },
    Tcp(SocketAddrV4),
}

enum Binder {
    Pipe(PipeListener),
    Tcp(TcpAcceptor),
}

impl Binder {
    async fn bind(spec: &ListenerSpec) -> io::Result<Self> {
        match spec {
            ListenerSpec::Pipe {
                path,
                allow_multiuser_access,
            } => Ok(Binder::Pipe(PipeListener::bind(path, *allow_multiuser_access)?)),
            ListenerSpec::Tcp(addr) => Ok(Binder::Tcp(TcpAcceptor::bind(*addr).await?)),
        }
    }

    async fn accept(&mut self) -> io::Result<BoxedStream> {
        match self {
            Binder::Pipe(listener) => listener.accept().await,
            Binder::Tcp(acceptor) => acceptor.accept().await,
        }
    }
}

enum Command {
    Write(WriteCommand),
    Broadcast(Bytes),
}

enum InternalEvent {
    /// Peer's read side ended (EOF, reset, or bad framing).
    PeerClosed(ConnectionId),
    /// Peer's writer task failed.
    WriteFailed(ConnectionId, io::Error),
}

struct Peer {
    writer: FrameWriterHandle,
    /// Forwards the writer task's outcome; awaited at teardown for the flush.
    writer_watch: JoinHandle<()>,
    read_task: JoinHandle<()>,
}

/// Handle to a running server transport loop.
pub(crate) struct ServerTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    peer_count: Arc<AtomicUsize>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ServerTransport {
    /// Spawn the loop thread and block until bind+listen has completed.
    ///
    /// Returns the bind error if the endpoint could not be claimed; the loop
    /// thread has already exited in that case.
    pub fn listen(
        spec: ListenerSpec,
        latest_only: bool,
        events: TransportEvents,
        options: TransportOptions,
    ) -> io::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<io::Result<()>>(1);
        let peer_count = Arc::new(AtomicUsize::new(0));

        let count = peer_count.clone();
        let thread = std::thread::Builder::new()
            .name("pipelink-server".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let binder = match Binder::bind(&spec).await {
                        Ok(binder) => binder,
                        Err(e) => {
                            events.log(0, LogLevel::Error, || format!("bind failed: {e}"));
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    events.log(0, LogLevel::Info, || "started successfully".to_string());
                    let _ = ready_tx.send(Ok(()));
                    run_loop(binder, latest_only, events, options, cmd_rx, shutdown_rx, count)
                        .await;
                    tracing::debug!("server transport loop finished");
                });
            })
            .expect("failed to spawn server transport thread");

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                shutdown_tx,
                peer_count,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "transport thread exited before reporting",
                ))
            }
        }
    }

    /// Queue a frame for one peer.
    pub fn send(&self, connection: ConnectionId, request_id: RequestId, body: Bytes) {
        let _ = self.cmd_tx.send(Command::Write(WriteCommand {
            connection,
            request_id,
            body,
        }));
    }

    /// Queue a fire-and-forget message for every currently-accepted peer.
    pub fn broadcast(&self, body: Bytes) {
        let _ = self.cmd_tx.send(Command::Broadcast(body));
    }

    /// Number of currently-accepted peers.
    pub fn active_connections(&self) -> usize {
        self.peer_count.load(Ordering::Acquire)
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut binder: Binder,
    latest_only: bool,
    events: TransportEvents,
    options: TransportOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
    peer_count: Arc<AtomicUsize>,
) {
    let events = Arc::new(events);
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
    let mut peers: HashMap<ConnectionId, Peer> = HashMap::new();
    let mut last_connection_id: ConnectionId = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Write(cmd)) => {
                    if let Some(peer) = peers.get(&cmd.connection) {
                        peer.writer.send(OutboundFrame::new(cmd.request_id, cmd.body));
                    } else {
                        if cmd.request_id != 0 && cmd.request_id & RESPONSE_FLAG == 0 {
                            (events.on_no_peer_for_request)(cmd.connection, cmd.request_id);
                        }
                        // Responses and messages for a vanished peer are dropped.
                    }
                }
                Some(Command::Broadcast(body)) => {
                    for peer in peers.values() {
                        peer.writer.send(OutboundFrame::new(0, body.clone()));
                    }
                }
                None => break,
            },

            accepted = binder.accept() => match accepted {
                Ok(stream) => {
                    if latest_only {
                        for (old_id, peer) in peers.drain() {
                            shutdown_peer(peer).await;
                            peer_count.fetch_sub(1, Ordering::AcqRel);
                            (events.on_disconnect)(old_id);
                        }
                    }

                    let id = next_connection_id(&mut last_connection_id);
                    let peer = start_peer(id, stream, &events, &options, &internal_tx);
                    peers.insert(id, peer);
                    peer_count.fetch_add(1, Ordering::AcqRel);

                    events.log(id, LogLevel::Debug, || "client connected".to_string());
                    (events.on_connect)(id);
                }
                Err(e) => {
                    events.log(0, LogLevel::Warning, || format!("accept failed: {e}"));
                }
            },

            event = internal_rx.recv() => match event {
                Some(InternalEvent::PeerClosed(id)) => {
                    if let Some(peer) = peers.remove(&id) {
                        drop(peer.writer);
                        peer_count.fetch_sub(1, Ordering::AcqRel);
                        (events.on_disconnect)(id);
                    }
                }
                Some(InternalEvent::WriteFailed(id, e)) => {
                    if let Some(peer) = peers.remove(&id) {
                        if !is_disconnect_error(&e) {
                            events.log(id, LogLevel::Error, || format!("write failed: {e}"));
                        }
                        peer.read_task.abort();
                        peer_count.fetch_sub(1, Ordering::AcqRel);
                        (events.on_disconnect)(id);
                    }
                }
                None => break,
            },
        }
    }

    // Graceful teardown: stop accepting, shut every peer down, then close
    // the binder (which unlinks the socket file on Unix).
    events.log(0, LogLevel::Info, || "shutting down".to_string());
    for (_, peer) in peers.drain() {
        shutdown_peer(peer).await;
    }
    drop(binder);
    peer_count.store(0, Ordering::Release);
}

/// Stop a peer's reads, flush and close its write side, and wait for both.
///
/// The wait is bounded so a peer that stopped reading cannot wedge the loop.
async fn shutdown_peer(peer: Peer) {
    peer.read_task.abort();
    drop(peer.writer);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(500), peer.writer_watch).await;
}

fn start_peer(
    id: ConnectionId,
    stream: BoxedStream,
    events: &Arc<TransportEvents>,
    options: &TransportOptions,
    internal_tx: &mpsc::UnboundedSender<InternalEvent>,
) -> Peer {
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer, writer_task) = spawn_frame_writer(write_half);

    let writer_watch = {
        let internal_tx = internal_tx.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                let _ = internal_tx.send(InternalEvent::WriteFailed(id, e));
            }
        })
    };

    let read_task = {
        let events = events.clone();
        let internal_tx = internal_tx.clone();
        let max_body_size = options.max_body_size;
        let read_buffer_size = options.read_buffer_size;
        tokio::spawn(async move {
            peer_read_loop(id, read_half, events, max_body_size, read_buffer_size).await;
            let _ = internal_tx.send(InternalEvent::PeerClosed(id));
        })
    };

    Peer {
        writer,
        writer_watch,
        read_task,
    }
}

async fn peer_read_loop(
    id: ConnectionId,
    mut read_half: tokio::io::ReadHalf<BoxedStream>,
    events: Arc<TransportEvents>,
    max_body_size: u32,
    read_buffer_size: usize,
) {
    let mut decoder = FrameBuffer::with_max_body(max_body_size);
    let mut scratch = vec![0u8; read_buffer_size];

    loop {
        match read_half.read(&mut scratch).await {
            Ok(0) => {
                events.log(id, LogLevel::Info, || "client disconnected".to_string());
                return;
            }
            Ok(n) => match decoder.push(&scratch[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        (events.on_data)(id, frame.request_id(), frame.body);
                    }
                }
                Err(e) => {
                    events.log(id, LogLevel::Warning, || format!("closing peer: {e}"));
                    return;
                }
            },
            Err(e) if is_disconnect_error(&e) => {
                events.log(id, LogLevel::Info, || format!("stream closed: {e}"));
                return;
            }
            Err(e) => {
                events.log(id, LogLevel::Warning, || {
                    format!("stream closed with error code: {e}")
                });
                return;
            }
        }
    }
}
