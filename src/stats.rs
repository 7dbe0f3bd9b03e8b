//! Routing outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::protocols::Protocol;
use crate::routing::{ConnectionId, RoutingError, RoutingObserver};

/// Counts routing outcomes as they happen.
#[derive(Debug, Default)]
pub struct RoutingStats {
    ping: AtomicU64,
    echo: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl RoutingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a point-in-time copy of the counters.
    pub fn snapshot(&self) -> RoutingStatsSnapshot {
        RoutingStatsSnapshot {
            ping: self.ping.load(Ordering::Relaxed),
            echo: self.echo.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl RoutingObserver<Protocol> for RoutingStats {
    fn on_routing_complete(&self, conn_id: ConnectionId, protocol: &Protocol) {
        let counter = match protocol {
            Protocol::Ping => &self.ping,
            Protocol::Echo => &self.echo,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = %conn_id, protocol = %protocol, "Connection routed");
    }

    fn on_routing_error(&self, conn_id: ConnectionId, error: &RoutingError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if matches!(error, RoutingError::Timeout(_)) {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        debug!(conn_id = %conn_id, error = %error, "Connection not routed");
    }
}

/// Routing counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStatsSnapshot {
    pub ping: u64,
    pub echo: u64,
    /// All failures, timeouts included.
    pub failed: u64,
    pub timed_out: u64,
}

impl RoutingStatsSnapshot {
    pub fn routed(&self) -> u64 {
        self.ping + self.echo
    }
}
