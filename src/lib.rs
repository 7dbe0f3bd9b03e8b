//! accept-router: route accepted connections to protocol pipelines
//!
//! A connection is classified from the first bytes it sends, then handed
//! to the downstream chain for its protocol together with any bytes the
//! classifier did not consume.
//!
//! - [`routing`]: the protocol-agnostic router, registry and traits
//! - [`protocols`]: the ping and echo chains plus the parsers that pick them
//! - [`server`]: a tokio TCP server driving the router

pub mod config;
pub mod protocols;
pub mod routing;
pub mod server;
pub mod stats;
pub mod transport;
