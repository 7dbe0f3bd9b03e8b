//! Channel-backed transport for tokio streams.
//!
//! Routing and downstream chains are synchronous, so they never touch the
//! socket directly. Writes are queued on a channel and a writer task drains
//! it into the stream's write half. The queue itself never refuses a write;
//! the connection's read loop waits on [`StreamTransport::writable`] so a
//! peer that stops reading stops being read from.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::routing::Transport;

/// Message queued for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Data(Bytes),
    Close,
}

/// Receiving end of a transport's queue, drained by [`write_loop`].
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Outbound>,
    queued: Arc<watch::Sender<usize>>,
}

/// Outbound half of an accepted connection.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Bytes written but not yet handed to the stream.
    queued: Arc<watch::Sender<usize>>,
}

impl StreamTransport {
    /// Create a transport and the queue its writer task drains.
    pub fn channel(peer: SocketAddr) -> (Self, OutboundQueue) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(watch::Sender::new(0));
        let queue = OutboundQueue {
            rx,
            queued: Arc::clone(&queued),
        };
        (
            Self {
                peer,
                outbound,
                queued,
            },
            queue,
        )
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes waiting for the writer task.
    pub fn queued(&self) -> usize {
        *self.queued.borrow()
    }

    /// Resolves once at most `limit` bytes are waiting for the writer task.
    ///
    /// Never resolves while the writer is stuck, so callers also watch
    /// [`closed`](Self::closed).
    pub async fn writable(&self, limit: usize) {
        let mut queued = self.queued.subscribe();
        let _ = queued.wait_for(|&n| n <= limit).await;
    }

    /// Resolves once the writer task has stopped.
    pub async fn closed(&self) {
        self.outbound.closed().await
    }
}

impl Transport for StreamTransport {
    fn write(&self, data: Bytes) {
        let len = data.len();
        // Counted before sending so the writer never subtracts first.
        self.queued.send_modify(|n| *n += len);
        // A send error means the writer is gone and the connection with it.
        if self.outbound.send(Outbound::Data(data)).is_err() {
            self.queued.send_modify(|n| *n = n.saturating_sub(len));
        }
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Drain queued writes into `writer` until a close is requested or every
/// transport handle is dropped, then shut the write side down.
pub async fn write_loop<W>(mut writer: W, mut queue: OutboundQueue) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = queue.rx.recv().await {
        match msg {
            Outbound::Data(data) => {
                writer.write_all(&data).await?;
                queue
                    .queued
                    .send_modify(|n| *n = n.saturating_sub(data.len()));
            }
            Outbound::Close => break,
        }
    }
    writer.shutdown().await
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Transport that records writes and close requests.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingTransport {
        written: Arc<Mutex<Vec<u8>>>,
        closes: Arc<AtomicUsize>,
    }

    impl RecordingTransport {
        pub(crate) fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        pub(crate) fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.close_count() > 0
        }
    }

    impl Transport for RecordingTransport {
        fn write(&self, data: Bytes) {
            self.written.lock().unwrap().extend_from_slice(&data);
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
