//! Ping protocol.
//!
//! A minimal protocol for health checks and latency measurement:
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n (then the connection closes)
//! ```

use bytes::{Bytes, BytesMut};
use std::io;
use tracing::{debug, trace, warn};

use super::find_crlf;
use crate::routing::{ConnectionId, DownstreamChain, Transport};

const MAX_LINE_LENGTH: usize = 1024;

/// Parsed ping command.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    Quit,
    Unknown,
}

/// Parse one line (without its \r\n). Commands are case-insensitive.
fn parse_line(line: &[u8]) -> Command<'_> {
    if line.eq_ignore_ascii_case(b"PING") {
        Command::Ping
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        Command::Quit
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        Command::PingMsg(&line[5..])
    } else {
        Command::Unknown
    }
}

/// Downstream chain answering ping commands.
pub struct PingChain<T> {
    conn_id: ConnectionId,
    transport: T,
    pending: BytesMut,
    closed: bool,
}

impl<T: Transport> PingChain<T> {
    pub fn new(conn_id: ConnectionId, transport: T) -> Self {
        Self {
            conn_id,
            transport,
            pending: BytesMut::new(),
            closed: false,
        }
    }

    fn process(&mut self) {
        while let Some(line_end) = find_crlf(&self.pending) {
            let line = self.pending.split_to(line_end + 2);

            match parse_line(&line[..line_end]) {
                Command::Ping => self.transport.write(Bytes::from_static(b"PONG\r\n")),
                Command::PingMsg(msg) => {
                    let mut resp = BytesMut::with_capacity(7 + msg.len());
                    resp.extend_from_slice(b"PONG ");
                    resp.extend_from_slice(msg);
                    resp.extend_from_slice(b"\r\n");
                    self.transport.write(resp.freeze());
                }
                Command::Quit => {
                    self.transport.write(Bytes::from_static(b"OK\r\n"));
                    self.shutdown();
                    return;
                }
                Command::Unknown => self
                    .transport
                    .write(Bytes::from_static(b"ERROR unknown command\r\n")),
            }
        }

        if self.pending.len() > MAX_LINE_LENGTH {
            warn!(conn_id = %self.conn_id, len = self.pending.len(), "Ping line too long");
            self.transport
                .write(Bytes::from_static(b"ERROR line too long\r\n"));
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.transport.close();
    }
}

impl<T: Transport> DownstreamChain for PingChain<T> {
    fn activate(&mut self) {
        debug!(conn_id = %self.conn_id, "Ping session started");
    }

    fn read(&mut self, data: BytesMut) {
        if self.closed {
            return;
        }
        self.pending.unsplit(data);
        self.process();
    }

    fn read_eof(&mut self) {
        trace!(conn_id = %self.conn_id, "Ping session closed by client");
    }

    fn read_error(&mut self, error: &io::Error) {
        debug!(conn_id = %self.conn_id, error = %error, "Ping session error");
    }
}
