//! Dedicated writer task, one per connected stream.
//!
//! Frames arrive over an mpsc channel and are written by a single task, which
//! keeps per-peer FIFO order without a lock around the write half and lets
//! several ready frames share one `write_vectored` syscall.
//!
//! ```text
//! engine thread ─┐
//! loop thread   ─┼─► mpsc::UnboundedSender<OutboundFrame> ─► writer task ─► stream
//! ```
//!
//! Closing the channel flushes what is queued, shuts down the write side of
//! the stream, and ends the task; the first write error ends it immediately
//! with that error.

use std::io;
use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{Header, HEADER_SIZE};

/// Maximum frames to batch into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the stream.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    /// Pre-encoded header (8 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Body bytes (may be empty).
    pub body: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(request_id: u32, body: Bytes) -> Self {
        Self {
            header: Header::new(request_id, body.len() as u32).encode(),
            body,
        }
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Handle for queueing frames onto the writer task. Cheaply cloneable.
#[derive(Clone)]
pub(crate) struct FrameWriterHandle {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl FrameWriterHandle {
    /// Queue a frame. Silently ignored once the writer has ended.
    pub fn send(&self, frame: OutboundFrame) {
        let _ = self.tx.send(frame);
    }
}

/// Spawn the writer task for a stream's write half.
///
/// Returns the sending handle and the task. The task resolves `Ok(())` after
/// a graceful close (all handles dropped, queue flushed, write side shut
/// down) or `Err` on the first failed write.
pub(crate) fn spawn_frame_writer<W>(
    writer: W,
) -> (FrameWriterHandle, JoinHandle<io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, writer));
    (FrameWriterHandle { tx }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut writer: W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => {
                // Channel closed: graceful shutdown of the write side.
                writer.shutdown().await?;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of frames with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.body.is_empty() {
            slices.push(IoSlice::new(&frame.body));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        ));
    }

    let mut total_written = written;
    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Rebuild the slice array for whatever survived a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;
        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.body.is_empty() {
            let body_start = skipped;
            let body_end = skipped + frame.body.len();
            if skip_bytes < body_end {
                let start_in_body = skip_bytes.saturating_sub(body_start);
                slices.push(IoSlice::new(&frame.body[start_in_body..]));
            }
            skipped = body_end;
        }
    }

    slices
}
