//! Accept-time connection routing.
//!
//! Every accepted connection starts out owned by the [`Router`]. Bytes are
//! buffered and handed to a per-connection [`RoutingDataParser`] until it can
//! classify the connection. The router then builds the downstream chain for
//! that classification, replays the unconsumed bytes into it and steps out of
//! the way: every later event for the connection goes straight to the chain.
//!
//! ## Lifecycle
//!
//! ```text
//!            transport-active
//!   Idle ────────────────────▶ Routing ──── classified ───▶ Routed
//!                                 │                           │
//!                                 ├── read error / parse ──▶ Failed
//!                                 │   error / timeout         │
//!                                 └── EOF ─────────────────▶ Closed ◀── EOF
//! ```
//!
//! The in-flight state of a `Routing` connection lives in the shared
//! [`ConnectionRegistry`] and is removed exactly once, whichever way the
//! connection leaves that phase.

mod downstream;
mod error;
mod parser;
mod registry;
mod router;

pub use downstream::{DownstreamChain, DownstreamPipelineFactory, Transport};
pub use error::{ParseError, RouterError, RoutingError};
pub use parser::{ParseStatus, RoutingDataParser, RoutingDataParserFactory};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use router::{ConnState, ConnectionEvent, RoutedConnection, Router, RoutingObserver};
