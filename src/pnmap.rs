//! Per-level packet-number map
//!
//! One [`PacketNumberMap`] exists per encryption level. It hands out
//! packet numbers, tracks inflight wire bytes, and carries the per-level
//! loss bookkeeping the retransmit path keys off: the pending loss
//! deadline, the send time of the most recent packet, and the highest
//! acknowledged number.

use std::time::{Duration, Instant};

/// Packet-number state for one encryption level.
#[derive(Debug)]
pub struct PacketNumberMap {
    next_number: u64,
    inflight: u64,
    loss_ts: Option<Instant>,
    last_sent_ts: Option<Instant>,
    max_pn_acked: u64,
    max_record_ts: Duration,
}

impl Default for PacketNumberMap {
    fn default() -> Self {
        PacketNumberMap {
            // Numbering starts at 1 so 0 can mean "never transmitted".
            next_number: 1,
            inflight: 0,
            loss_ts: None,
            last_sent_ts: None,
            max_pn_acked: 0,
            max_record_ts: Duration::ZERO,
        }
    }
}

impl PacketNumberMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number the next sealed packet will get.
    pub fn next_number(&self) -> u64 {
        self.next_number
    }

    /// Consume and return the next packet number.
    pub fn advance(&mut self) -> u64 {
        let number = self.next_number;
        self.next_number += 1;
        number
    }

    /// Wire bytes sent and not yet acknowledged or declared lost.
    pub fn inflight(&self) -> u64 {
        self.inflight
    }

    pub fn inc_inflight(&mut self, len: u32) {
        self.inflight += u64::from(len);
    }

    pub fn dec_inflight(&mut self, len: u32) {
        self.inflight = self.inflight.saturating_sub(u64::from(len));
    }

    /// Pending loss deadline recorded by the retransmit scan.
    pub fn loss_ts(&self) -> Option<Instant> {
        self.loss_ts
    }

    pub fn set_loss_ts(&mut self, ts: Option<Instant>) {
        self.loss_ts = ts;
    }

    /// Send time of the most recently sealed packet at this level.
    pub fn last_sent_ts(&self) -> Option<Instant> {
        self.last_sent_ts
    }

    pub fn set_last_sent_ts(&mut self, ts: Instant) {
        self.last_sent_ts = Some(ts);
    }

    /// Highest packet number the peer has acknowledged.
    pub fn max_pn_acked(&self) -> u64 {
        self.max_pn_acked
    }

    pub fn set_max_pn_acked(&mut self, number: u64) {
        if number > self.max_pn_acked {
            self.max_pn_acked = number;
        }
    }

    /// Retention period for acknowledged-number records, refreshed to
    /// twice the RTO on each RTT sample.
    pub fn max_record_ts(&self) -> Duration {
        self.max_record_ts
    }

    pub fn set_max_record_ts(&mut self, period: Duration) {
        self.max_record_ts = period;
    }
}
