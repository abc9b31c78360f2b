//! Client transport loop.
//!
//! One OS thread per client connection runs a current-thread tokio runtime
//! driving the dial / retry / connected state machine. Remote closes trigger
//! automatic redial until the user disconnects; the retry delay grows
//! linearly from 2 ms to a 100 ms ceiling and is never reset, so a flapping
//! server settles into a sub-second reconnect cadence.

use std::io;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

use super::writer::{spawn_frame_writer, OutboundFrame};
use super::{pipe, tcp, TransportEvents, TransportOptions, WriteCommand};
use crate::logging::LogLevel;
use crate::protocol::{ConnectionId, FrameBuffer, RequestId};

/// Retry delay counter start (units of 100 µs → 2 ms).
const RETRY_START_UNITS: u64 = 20;
/// Retry delay counter cap (units of 100 µs → 100 ms).
const RETRY_MAX_UNITS: u64 = 1000;

/// Where the client dials to.
pub(crate) enum Dialer {
    Pipe(String),
    Tcp(SocketAddrV4),
}

impl Dialer {
    async fn dial(&self) -> io::Result<super::BoxedStream> {
        match self {
            Dialer::Pipe(path) => pipe::connect(path).await,
            Dialer::Tcp(addr) => tcp::connect(*addr).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Dialer::Pipe(path) => path.clone(),
            Dialer::Tcp(addr) => addr.to_string(),
        }
    }
}

/// Handle to a running client transport loop.
///
/// Dropping it signals the loop to tear down and joins the thread, so two
/// loop threads for one connection can never overlap.
pub(crate) struct ClientTransport {
    cmd_tx: mpsc::UnboundedSender<WriteCommand>,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ClientTransport {
    /// Spawn the loop thread and block until it has started dialing.
    pub fn start(dialer: Dialer, events: TransportEvents, options: TransportOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<()>(1);

        let thread = std::thread::Builder::new()
            .name("pipelink-client".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        events.log(0, LogLevel::Error, || {
                            format!("failed to build event loop: {e}")
                        });
                        // Dropping ready_tx unblocks the caller.
                        return;
                    }
                };
                tracing::debug!("client transport loop starting");
                runtime.block_on(run_loop(
                    dialer,
                    events,
                    options,
                    cmd_rx,
                    shutdown_rx,
                    ready_tx,
                ));
                tracing::debug!("client transport loop finished");
            })
            .expect("failed to spawn client transport thread");

        let _ = ready_rx.recv();

        Self {
            cmd_tx,
            shutdown_tx,
            thread: Some(thread),
        }
    }

    /// Queue a frame for the (single) peer.
    pub fn send(&self, connection: ConnectionId, request_id: RequestId, body: Bytes) {
        let _ = self.cmd_tx.send(WriteCommand {
            connection,
            request_id,
            body,
        });
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Why a connected session ended.
enum Closed {
    /// User asked the loop to exit.
    Shutdown,
    /// Peer went away; redial.
    Remote,
}

async fn run_loop(
    dialer: Dialer,
    events: TransportEvents,
    options: TransportOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<WriteCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    ready_tx: std::sync::mpsc::SyncSender<()>,
) {
    let mut retry_units = RETRY_START_UNITS;
    let mut ready_tx = Some(ready_tx);

    'reconnect: loop {
        // Connecting: dial until success, shutdown, or forever.
        let stream = loop {
            if *shutdown_rx.borrow() {
                return;
            }
            // Unblock connect() once the first dial attempt is under way.
            if let Some(ready) = ready_tx.take() {
                let _ = ready.send(());
            }
            let attempt = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                attempt = dialer.dial() => attempt,
            };
            match attempt {
                Ok(stream) => break stream,
                Err(_) => {
                    if retry_units < RETRY_MAX_UNITS {
                        retry_units += 1;
                    }
                    let delay = std::time::Duration::from_micros(retry_units * 100);
                    tokio::select! {
                        _ = shutdown_rx.changed() => continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        events.log(0, LogLevel::Info, || {
            format!("connected to {}", dialer.describe())
        });
        (events.on_connect)(0);

        match run_connected(stream, &events, &options, &mut cmd_rx, &mut shutdown_rx).await {
            Closed::Shutdown => return,
            Closed::Remote => {
                (events.on_disconnect)(0);
                continue 'reconnect;
            }
        }
    }
}

async fn run_connected(
    stream: super::BoxedStream,
    events: &TransportEvents,
    options: &TransportOptions,
    cmd_rx: &mut mpsc::UnboundedReceiver<WriteCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Closed {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (writer, mut writer_task) = spawn_frame_writer(write_half);
    let mut writer_alive = true;

    let mut decoder = FrameBuffer::with_max_body(options.max_body_size);
    let mut scratch = vec![0u8; options.read_buffer_size];

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                // Flush and close the write side, but never wedge teardown
                // on a peer that stopped reading.
                drop(writer);
                if writer_alive {
                    let _ = tokio::time::timeout(
                        std::time::Duration::from_millis(500),
                        writer_task,
                    )
                    .await;
                }
                return Closed::Shutdown;
            }

            cmd = cmd_rx.recv(), if writer_alive => {
                match cmd {
                    Some(cmd) => writer.send(OutboundFrame::new(cmd.request_id, cmd.body)),
                    None => {
                        drop(writer);
                        let _ = tokio::time::timeout(
                            std::time::Duration::from_millis(500),
                            writer_task,
                        )
                        .await;
                        return Closed::Shutdown;
                    }
                }
            }

            result = &mut writer_task, if writer_alive => {
                writer_alive = false;
                match result {
                    Ok(Err(e)) if is_disconnect_error(&e) => {
                        events.log(0, LogLevel::Info, || format!("write side closed: {e}"));
                        return Closed::Remote;
                    }
                    Ok(Err(e)) => {
                        // Session survives; reads keep running, writes stop.
                        events.log(0, LogLevel::Error, || format!("write failed: {e}"));
                        (events.on_error)(0);
                    }
                    _ => {}
                }
            }

            read = read_half.read(&mut scratch) => {
                match read {
                    Ok(0) => {
                        events.log(0, LogLevel::Info, || "disconnected by server".to_string());
                        return Closed::Remote;
                    }
                    Ok(n) => match decoder.push(&scratch[..n]) {
                        Ok(frames) => {
                            for frame in frames {
                                (events.on_data)(0, frame.request_id(), frame.body);
                            }
                        }
                        Err(e) => {
                            events.log(0, LogLevel::Warning, || {
                                format!("closing stream: {e}")
                            });
                            return Closed::Remote;
                        }
                    },
                    Err(e) if is_disconnect_error(&e) => {
                        events.log(0, LogLevel::Info, || format!("stream closed: {e}"));
                        return Closed::Remote;
                    }
                    Err(e) => {
                        events.log(0, LogLevel::Warning, || {
                            format!("stream closed with error: {e}")
                        });
                        return Closed::Remote;
                    }
                }
            }
        }
    }
}

/// Errors that mean "the peer went away" rather than a real fault.
pub(crate) fn is_disconnect_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_schedule_bounds() {
        let mut units = RETRY_START_UNITS;
        assert_eq!(std::time::Duration::from_micros(units * 100).as_millis(), 2);

        for _ in 0..10_000 {
            if units < RETRY_MAX_UNITS {
                units += 1;
            }
        }
        assert_eq!(units, RETRY_MAX_UNITS);
        assert_eq!(
            std::time::Duration::from_micros(units * 100).as_millis(),
            100
        );
    }

    #[test]
    fn test_disconnect_error_classification() {
        assert!(is_disconnect_error(&io::Error::from(
            io::ErrorKind::BrokenPipe
        )));
        assert!(is_disconnect_error(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_disconnect_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
