//! Traffic counters and slot snapshots. Counters are plain relaxed atomics
//! so operators can read them without touching the transport mutex.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::Subnet;
use crate::protocol::{Niceness, MAX_MSG_TYPES};
use crate::slot::SlotPhase;

#[derive(Debug, Default)]
pub struct IfaceCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
}

impl IfaceCounters {
    fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IfaceSnapshot {
        IfaceSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct IfaceSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// All transport-wide counters. Traffic is classified against the two
/// configured primary subnets; everything else lands in the outsider
/// bucket.
pub struct TransportStats {
    primary_subnet: Option<Subnet>,
    secondary_subnet: Option<Subnet>,
    primary: IfaceCounters,
    secondary: IfaceCounters,
    outsider: IfaceCounters,

    pub(crate) malformed_dropped: AtomicU64,
    pub(crate) unmatched_dropped: AtomicU64,
    pub(crate) retransmitted_dgrams: AtomicU64,

    /// Requests received but not yet answered, per message type.
    /// Observability only.
    in_waiting: Vec<AtomicU64>,
}

impl TransportStats {
    pub(crate) fn new(primary_subnet: Option<Subnet>, secondary_subnet: Option<Subnet>) -> TransportStats {
        TransportStats {
            primary_subnet,
            secondary_subnet,
            primary: IfaceCounters::default(),
            secondary: IfaceCounters::default(),
            outsider: IfaceCounters::default(),
            malformed_dropped: AtomicU64::new(0),
            unmatched_dropped: AtomicU64::new(0),
            retransmitted_dgrams: AtomicU64::new(0),
            in_waiting: (0..MAX_MSG_TYPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn classify(&self, peer: SocketAddr) -> &IfaceCounters {
        if self.primary_subnet.is_some_and(|s| s.contains(peer.ip())) {
            &self.primary
        } else if self.secondary_subnet.is_some_and(|s| s.contains(peer.ip())) {
            &self.secondary
        } else {
            &self.outsider
        }
    }

    pub(crate) fn record_in(&self, peer: SocketAddr, bytes: usize) {
        self.classify(peer).record_in(bytes);
    }

    pub(crate) fn record_out(&self, peer: SocketAddr, bytes: usize) {
        self.classify(peer).record_out(bytes);
    }

    pub(crate) fn inc_in_waiting(&self, msg_type: u8) {
        self.in_waiting[msg_type as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_in_waiting(&self, msg_type: u8) {
        self.in_waiting[msg_type as usize].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn requests_in_waiting(&self, msg_type: u8) -> u64 {
        self.in_waiting[msg_type as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            primary: self.primary.snapshot(),
            secondary: self.secondary.snapshot(),
            outsider: self.outsider.snapshot(),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            unmatched_dropped: self.unmatched_dropped.load(Ordering::Relaxed),
            retransmitted_dgrams: self.retransmitted_dgrams.load(Ordering::Relaxed),
            requests_in_waiting: self.in_waiting.iter().map(|g| g.load(Ordering::Relaxed)).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub primary: IfaceSnapshot,
    pub secondary: IfaceSnapshot,
    pub outsider: IfaceSnapshot,
    pub malformed_dropped: u64,
    pub unmatched_dropped: u64,
    pub retransmitted_dgrams: u64,
    pub requests_in_waiting: Vec<u64>,
}

/// Point-in-time summary of one live slot.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub trans_id: u32,
    pub peer: SocketAddr,
    pub incoming: bool,
    pub msg_type: u8,
    pub niceness: Niceness,
    pub phase: SlotPhase,
    pub age: Duration,
    pub resend_count: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::str::FromStr;

    #[test]
    fn test_classification() {
        let primary = Subnet { net: IpAddr::from_str("10.5.0.0").unwrap(), prefix_len: 16 };
        let secondary = Subnet { net: IpAddr::from_str("10.6.0.0").unwrap(), prefix_len: 16 };
        let stats = TransportStats::new(Some(primary), Some(secondary));

        stats.record_in(SocketAddr::from_str("10.5.1.2:80").unwrap(), 100);
        stats.record_out(SocketAddr::from_str("10.6.1.2:80").unwrap(), 50);
        stats.record_in(SocketAddr::from_str("192.168.0.1:80").unwrap(), 7);

        let snap = stats.snapshot();
        assert_eq!(snap.primary, IfaceSnapshot { bytes_in: 100, bytes_out: 0, packets_in: 1, packets_out: 0 });
        assert_eq!(snap.secondary, IfaceSnapshot { bytes_in: 0, bytes_out: 50, packets_in: 0, packets_out: 1 });
        assert_eq!(snap.outsider, IfaceSnapshot { bytes_in: 7, bytes_out: 0, packets_in: 1, packets_out: 0 });
    }

    #[test]
    fn test_in_waiting_gauge() {
        let stats = TransportStats::new(None, None);
        stats.inc_in_waiting(3);
        stats.inc_in_waiting(3);
        stats.dec_in_waiting(3);
        assert_eq!(stats.requests_in_waiting(3), 1);
        assert_eq!(stats.requests_in_waiting(4), 0);
    }
}
