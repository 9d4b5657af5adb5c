//! Process-wide traffic counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use natrelay_tunnel::TrafficCounters;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct ServerStats {
    traffic: Arc<TrafficCounters>,
    consumer_connections: AtomicU64,
    control_connections: AtomicU64,
    reverse_connections: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Consumer to client
    pub total_bytes_sent: u64,
    /// Client to consumer
    pub total_bytes_received: u64,
    pub consumer_connections: u64,
    pub control_connections: u64,
    pub reverse_connections: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counters handed to every tunnel session
    pub fn traffic(&self) -> Arc<TrafficCounters> {
        self.traffic.clone()
    }

    pub fn record_consumer_connection(&self) {
        self.consumer_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_connection(&self) {
        self.control_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reverse_connection(&self) {
        self.reverse_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_bytes_sent: self.traffic.sent(),
            total_bytes_received: self.traffic.received(),
            consumer_connections: self.consumer_connections.load(Ordering::Relaxed),
            control_connections: self.control_connections.load(Ordering::Relaxed),
            reverse_connections: self.reverse_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = ServerStats::new();
        stats.record_consumer_connection();
        stats.record_consumer_connection();
        stats.record_control_connection();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.consumer_connections, 2);
        assert_eq!(snapshot.control_connections, 1);
        assert_eq!(snapshot.reverse_connections, 0);
        assert_eq!(snapshot.total_bytes_sent, 0);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["consumer_connections"], 2);
    }
}
