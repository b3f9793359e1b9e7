//! Statistics plumbing: per-session delta counters, server counters,
//! point-in-time snapshots, and the fixed-width table printer.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Per-reactor information reported through the management surface.
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub context_index: usize,
    pub threads: usize,
    pub active_sessions: usize,
    pub strand_pool_size: usize,
    pub strand_pool_in_flight: usize,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_id: i32,
    pub contexts: Vec<ContextInfo>,
}

/// Updated by the acceptor, polled by the stats surface.
#[derive(Default)]
pub struct ServerStats {
    pub accepted: AtomicU64,
}

/// Session counters with delta semantics: the snapshot path exchanges each
/// to zero, so a session never has to coordinate a reset with the
/// collector.
#[derive(Default)]
pub struct SessionStatsDelta {
    pub transactions: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl SessionStatsDelta {
    pub fn take(&self) -> (u64, u64, u64) {
        (
            self.transactions.swap(0, Ordering::AcqRel),
            self.bytes_received.swap(0, Ordering::AcqRel),
            self.bytes_sent.swap(0, Ordering::AcqRel),
        )
    }
}

/// One sample of a single server's statistics.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub timestamp_micros: u64,
    pub accepted: u64,
    pub pool_total: usize,
    pub pool_in_flight: usize,
    pub transactions_delta: u64,
    pub bytes_received_delta: u64,
    pub bytes_sent_delta: u64,
}

const COLUMNS: [(usize, &str); 7] = [
    (16, "t"),
    (10, "Accepted"),
    (10, "Total"),
    (11, "In flight"),
    (10, "Trans"),
    (19, "Received"),
    (15, "Sent"),
];

/// Renders snapshot rows, re-printing the header every `header_interval`
/// rows (0 disables the header entirely).
pub struct StatsPrinter {
    header_interval: u64,
    row: u64,
}

impl StatsPrinter {
    pub fn new(header_interval: u64) -> Self {
        Self {
            header_interval,
            row: 0,
        }
    }

    pub fn render(&mut self, snapshot: &StatsSnapshot) -> String {
        let mut out = String::new();

        if self.header_interval != 0 && self.row % self.header_interval == 0 {
            out.push('\n');
            for (width, name) in COLUMNS {
                let _ = write!(out, "{name:>width$}");
            }
            out.push('\n');
        }
        self.row += 1;

        let values: [u64; 7] = [
            snapshot.timestamp_micros,
            snapshot.accepted,
            snapshot.pool_total as u64,
            snapshot.pool_in_flight as u64,
            snapshot.transactions_delta,
            snapshot.bytes_received_delta,
            snapshot.bytes_sent_delta,
        ];
        for ((width, _), value) in COLUMNS.into_iter().zip(values) {
            let _ = write!(out, "{value:>width$}");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StatsSnapshot {
        StatsSnapshot {
            timestamp_micros: 1,
            accepted: 2,
            pool_total: 3,
            pool_in_flight: 4,
            transactions_delta: 5,
            bytes_received_delta: 6,
            bytes_sent_delta: 7,
        }
    }

    #[test]
    fn header_reprints_on_interval() {
        let mut printer = StatsPrinter::new(2);
        assert!(printer.render(&snapshot()).contains("Accepted"));
        assert!(!printer.render(&snapshot()).contains("Accepted"));
        assert!(printer.render(&snapshot()).contains("Accepted"));
    }

    #[test]
    fn zero_interval_disables_header() {
        let mut printer = StatsPrinter::new(0);
        for _ in 0..5 {
            assert!(!printer.render(&snapshot()).contains("Accepted"));
        }
    }

    #[test]
    fn deltas_reset_on_take() {
        let delta = SessionStatsDelta::default();
        delta.transactions.fetch_add(3, Ordering::SeqCst);
        delta.bytes_received.fetch_add(10, Ordering::SeqCst);
        assert_eq!(delta.take(), (3, 10, 0));
        assert_eq!(delta.take(), (0, 0, 0));
    }
}
