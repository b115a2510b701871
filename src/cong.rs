//! Congestion control and RTT estimation
//!
//! NewReno-style controller driven by the egress core: RTT samples come
//! in from acknowledgment processing, window updates from the ACK and
//! loss paths. The core mirrors `window()` into its own gating state
//! after every update.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

const RTO_MIN: Duration = Duration::from_millis(100);
const RTO_MAX: Duration = Duration::from_secs(6);
const INITIAL_RTO: Duration = Duration::from_millis(500);
const GRANULARITY: Duration = Duration::from_millis(1);

/// Round-trip time statistics
#[derive(Debug, Default, Clone)]
pub struct RttStats {
    pub latest_rtt: Option<Duration>,
    pub smoothed_rtt: Option<Duration>,
    pub rtt_var: Duration,
    pub min_rtt: Option<Duration>,
}

/// Congestion controller state
#[derive(Debug)]
pub struct CongestionController {
    mss: u32,
    window: u64,
    ssthresh: u64,
    min_window: u64,
    max_ack_delay: Duration,
    rtt: RttStats,
    /// Send time marking the current recovery epoch; losses of packets
    /// sent before this point do not reduce the window again.
    recovery_start: Option<Instant>,
}

impl CongestionController {
    /// Create a controller for the given maximum segment size.
    pub fn new(mss: u32) -> Self {
        let mss64 = u64::from(mss);
        CongestionController {
            mss,
            window: 10 * mss64, // RFC 9002 initial window
            ssthresh: u64::MAX,
            min_window: 2 * mss64,
            max_ack_delay: Duration::ZERO,
            rtt: RttStats::default(),
            recovery_start: None,
        }
    }

    /// Current congestion window in bytes.
    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn rtt_stats(&self) -> &RttStats {
        &self.rtt
    }

    pub fn set_max_ack_delay(&mut self, delay: Duration) {
        self.max_ack_delay = delay;
    }

    /// Feed one RTT sample: the send time of the newest acked packet and
    /// the peer-reported ack delay.
    pub fn rtt_update(&mut self, transmit_ts: Instant, ack_delay: Duration, now: Instant) {
        let latest = now.saturating_duration_since(transmit_ts);
        self.rtt.latest_rtt = Some(latest);

        if self.rtt.min_rtt.map_or(true, |min| latest < min) {
            self.rtt.min_rtt = Some(latest);
        }

        // Discount the peer's ack delay, but never below the observed floor.
        let adjusted = match self.rtt.min_rtt {
            Some(min) => latest.saturating_sub(ack_delay).max(min),
            None => latest.saturating_sub(ack_delay),
        };

        if let Some(smoothed) = self.rtt.smoothed_rtt {
            let diff = if adjusted > smoothed { adjusted - smoothed } else { smoothed - adjusted };
            self.rtt.rtt_var = (self.rtt.rtt_var * 3 + diff) / 4;
            self.rtt.smoothed_rtt = Some((smoothed * 7 + adjusted) / 8);
        } else {
            self.rtt.smoothed_rtt = Some(adjusted);
            self.rtt.rtt_var = adjusted / 2;
        }

        debug!(
            "rtt sample: latest={:?} smoothed={:?} var={:?}",
            latest, self.rtt.smoothed_rtt, self.rtt.rtt_var
        );
    }

    /// Retransmission timeout derived from the current RTT estimate.
    pub fn rto(&self) -> Duration {
        match self.rtt.smoothed_rtt {
            Some(smoothed) => {
                (smoothed + (self.rtt.rtt_var * 4).max(GRANULARITY)).clamp(RTO_MIN, RTO_MAX)
            }
            None => INITIAL_RTO,
        }
    }

    /// Base period for the per-level loss timer: the RTO widened by the
    /// peer's maximum ack delay.
    pub fn duration(&self) -> Duration {
        self.rto() + self.max_ack_delay
    }

    /// Window update after acknowledgments retired `acked_bytes`.
    ///
    /// `acked_number`/`transmit_ts` identify the newest acked packet,
    /// `inflight` is the sender's data-bytes-in-flight after retiring.
    pub fn cwnd_update_after_sack(
        &mut self,
        _acked_number: u64,
        transmit_ts: Instant,
        acked_bytes: u64,
        inflight: u64,
    ) {
        if let Some(start) = self.recovery_start {
            if transmit_ts <= start {
                // Ack for a packet sent before recovery began; the window
                // already paid for this loss episode.
                return;
            }
            self.recovery_start = None;
            debug!("recovery exited");
        }

        // Application-limited: no growth while the window is half idle.
        if inflight.saturating_add(acked_bytes) < self.window / 2 {
            return;
        }

        if self.window < self.ssthresh {
            self.window += acked_bytes;
        } else {
            self.window += u64::from(self.mss) * acked_bytes / self.window;
        }
    }

    /// Window update after the loss scan declared `number` (sent at
    /// `transmit_ts`) lost. `last` is the highest number sent so far.
    pub fn cwnd_update_after_timeout(&mut self, number: u64, transmit_ts: Instant, last: u64) {
        if let Some(start) = self.recovery_start {
            if transmit_ts <= start {
                return;
            }
        }
        self.recovery_start = Some(transmit_ts);
        self.ssthresh = (self.window / 2).max(self.min_window);
        self.window = self.ssthresh;
        if number == last {
            // The newest packet in flight is gone too: the whole flight
            // is presumed lost, collapse to the floor.
            self.window = self.min_window;
        }
        warn!("loss: packet {} declared lost, cwnd now {}", number, self.window);
    }
}
