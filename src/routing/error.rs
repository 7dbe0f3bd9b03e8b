use std::io;
use std::time::Duration;

use thiserror::Error;

use super::ConnectionId;

/// Errors reported by a routing data parser.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The first bytes match no known protocol.
    #[error("unrecognized leading byte 0x{byte:02x}")]
    Unrecognized { byte: u8 },
    /// A routing preamble was expected but the bytes do not form one.
    #[error("invalid routing preamble: {0}")]
    InvalidPreamble(String),
    /// The preamble names a protocol nobody serves.
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    /// The routing buffer grew past its cap without a classification.
    #[error("routing buffer exceeded {limit} bytes")]
    BufferLimit { limit: usize },
}

/// Why routing failed for a connection.
///
/// Delivered to [`RoutingObserver::on_routing_error`](super::RoutingObserver).
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("no routing decision after {0:?}")]
    Timeout(Duration),
}

/// Contract violations by the event source.
///
/// These are not recoverable per connection.
#[derive(Debug, Error)]
pub enum RouterError {
    /// `transport-active` arrived for an id that is already routing or
    /// for a connection handle that was already activated.
    #[error("connection {0} activated twice")]
    DuplicateActivation(ConnectionId),
}
