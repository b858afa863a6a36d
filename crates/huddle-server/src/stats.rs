//! Inbound/outbound traffic counters.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;

/// Default interval between traffic log lines.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Byte counters shared by every connection of a server.
#[derive(Debug, Default)]
pub struct TrafficStats {
    inbound: AtomicU64,
    outbound: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Bytes received from clients.
    pub inbound_bytes: u64,
    /// Bytes written to clients.
    pub outbound_bytes: u64,
}

impl TrafficStats {
    /// Count `bytes` read from a client.
    pub fn record_inbound(&self, bytes: usize) {
        self.inbound.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count `bytes` written to a client.
    pub fn record_outbound(&self, bytes: usize) {
        self.outbound.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Current totals.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            inbound_bytes: self.inbound.load(Ordering::Relaxed),
            outbound_bytes: self.outbound.load(Ordering::Relaxed),
        }
    }

    /// Log the totals every `interval` until the task is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = stats.snapshot();
                tracing::info!(
                    inbound_bytes = snapshot.inbound_bytes,
                    outbound_bytes = snapshot.outbound_bytes,
                    "traffic"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let stats = TrafficStats::default();

        stats.record_inbound(10);
        stats.record_inbound(5);
        stats.record_outbound(7);

        assert_eq!(stats.snapshot(), TrafficSnapshot { inbound_bytes: 15, outbound_bytes: 7 });
    }
}
