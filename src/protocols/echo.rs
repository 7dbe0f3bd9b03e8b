//! Echo protocol.
//!
//! Length-prefixed binary echo for throughput and I/O testing:
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! `QUIT\r\n` in place of a length closes the connection gracefully.

use bytes::{Bytes, BytesMut};
use std::io;
use tracing::{debug, trace};

use super::find_crlf;
use crate::routing::{ConnectionId, DownstreamChain, Transport};

/// Longest length line accepted before giving up on the client.
const MAX_HEADER_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a `<length>\r\n` line.
    Header,
    /// Waiting for this many payload bytes.
    Payload(usize),
    /// Skipping the payload of a rejected request.
    Discard(usize),
}

/// Downstream chain echoing length-prefixed payloads.
pub struct EchoChain<T> {
    conn_id: ConnectionId,
    transport: T,
    max_size: usize,
    pending: BytesMut,
    state: State,
    closed: bool,
}

impl<T: Transport> EchoChain<T> {
    pub fn new(conn_id: ConnectionId, transport: T, max_size: usize) -> Self {
        Self {
            conn_id,
            transport,
            max_size,
            pending: BytesMut::new(),
            state: State::Header,
            closed: false,
        }
    }

    fn process(&mut self) {
        loop {
            match self.state {
                State::Header => {
                    let Some(line_end) = find_crlf(&self.pending) else {
                        if self.pending.len() > MAX_HEADER_LENGTH {
                            self.error("invalid length");
                            self.shutdown();
                        }
                        return;
                    };

                    let header = self.pending.split_to(line_end + 2);
                    let line = &header[..line_end];

                    if line.eq_ignore_ascii_case(b"QUIT") {
                        self.transport.write(Bytes::from_static(b"OK\r\n"));
                        self.shutdown();
                        return;
                    }

                    match parse_length(line) {
                        Some(length) if length <= self.max_size => {
                            self.state = State::Payload(length);
                        }
                        Some(length) => {
                            debug!(conn_id = %self.conn_id, length, "Echo payload too large");
                            self.error("payload too large");
                            self.state = State::Discard(length);
                        }
                        None => self.error("invalid length"),
                    }
                }
                State::Payload(length) => {
                    if self.pending.len() < length {
                        return;
                    }
                    let payload = self.pending.split_to(length).freeze();
                    self.transport.write(Bytes::from(format!("{length}\r\n")));
                    self.transport.write(payload);
                    self.state = State::Header;
                }
                State::Discard(remaining) => {
                    let skip = remaining.min(self.pending.len());
                    let _ = self.pending.split_to(skip);
                    if skip < remaining {
                        self.state = State::Discard(remaining - skip);
                        return;
                    }
                    self.state = State::Header;
                }
            }
        }
    }

    fn error(&self, msg: &str) {
        self.transport
            .write(Bytes::from(format!("ERROR {msg}\r\n")));
    }

    fn shutdown(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.transport.close();
    }
}

fn parse_length(line: &[u8]) -> Option<usize> {
    std::str::from_utf8(line).ok()?.trim().parse().ok()
}

impl<T: Transport> DownstreamChain for EchoChain<T> {
    fn activate(&mut self) {
        debug!(conn_id = %self.conn_id, max_size = self.max_size, "Echo session started");
    }

    fn read(&mut self, data: BytesMut) {
        if self.closed {
            return;
        }
        self.pending.unsplit(data);
        self.process();
    }

    fn read_eof(&mut self) {
        if let State::Payload(length) | State::Discard(length) = self.state {
            debug!(
                conn_id = %self.conn_id,
                length,
                received = self.pending.len(),
                "Echo client closed mid-payload"
            );
        } else {
            trace!(conn_id = %self.conn_id, "Echo session closed by client");
        }
    }

    fn read_error(&mut self, error: &io::Error) {
        debug!(conn_id = %self.conn_id, error = %error, "Echo session error");
    }
}
