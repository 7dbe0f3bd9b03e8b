//! Routing data parser contract.

use std::io;

use super::{ConnectionId, ParseError};

/// Result of feeding the buffered bytes to a parser.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseStatus<D> {
    /// Not enough bytes to decide yet.
    NeedData,
    /// The connection is classified as `data`.
    ///
    /// The first `consumed` bytes belong to the routing layer; the rest of
    /// the buffer is replayed into the downstream chain.
    Classified { data: D, consumed: usize },
}

/// Incremental classifier, one instance per connection.
///
/// `parse` always sees everything buffered so far, so it must give the same
/// answer for the same prefix no matter how often it is called.
///
/// Every call comes from the connection's own task with no router lock
/// held, so a parser may query the router it belongs to.
pub trait RoutingDataParser<D>: Send + Sync {
    /// The connection became active.
    fn on_activated(&mut self) {}

    /// Inspect the bytes buffered so far.
    fn parse(&mut self, buffer: &[u8]) -> Result<ParseStatus<D>, ParseError>;

    /// The transport failed while classification was pending.
    fn on_read_error(&mut self, _error: &io::Error) {}
}

/// Produces a fresh parser for each accepted connection.
pub trait RoutingDataParserFactory<D>: Send + Sync {
    fn create(&self, conn_id: ConnectionId) -> Box<dyn RoutingDataParser<D>>;
}

impl<D, F> RoutingDataParserFactory<D> for F
where
    F: Fn(ConnectionId) -> Box<dyn RoutingDataParser<D>> + Send + Sync,
{
    fn create(&self, conn_id: ConnectionId) -> Box<dyn RoutingDataParser<D>> {
        self(conn_id)
    }
}
