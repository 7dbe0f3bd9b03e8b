//! Capabilities the router needs from the transport and downstream chains.

use std::io;

use bytes::{Bytes, BytesMut};

use super::ConnectionId;

/// Handle to a live connection's outbound side.
///
/// Owned by the routing entry while the connection is being classified and
/// moved into the downstream chain on handoff.
pub trait Transport: Send + Sync + 'static {
    /// Queue bytes for the peer.
    fn write(&self, data: Bytes);

    /// Flush pending writes and close the connection.
    fn close(&self);
}

/// Handler chain that owns a connection after routing.
pub trait DownstreamChain: Send {
    /// The chain now owns the connection. Always the first call.
    fn activate(&mut self);

    /// Bytes from the peer, in arrival order.
    fn read(&mut self, data: BytesMut);

    /// The peer closed its side.
    fn read_eof(&mut self);

    /// The transport reported an error after the handoff.
    fn read_error(&mut self, error: &io::Error);
}

/// Builds the downstream chain for a classified connection.
pub trait DownstreamPipelineFactory<D, T>: Send + Sync {
    fn build(&self, conn_id: ConnectionId, transport: T, data: D) -> Box<dyn DownstreamChain>;
}
