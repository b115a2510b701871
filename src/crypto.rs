//! Per-level crypto readiness
//!
//! The egress core never touches key material; it only needs to know
//! whether a level can encrypt outbound packets, and to push the
//! key-update deadline forward as RTT estimates change. Key derivation
//! and AEAD live with the packet protection backend.

use std::time::Duration;

/// Send-side crypto state for one encryption level.
#[derive(Debug, Default)]
pub struct CryptoState {
    send_ready: bool,
    key_update_ts: Duration,
}

impl CryptoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this level has send keys installed.
    pub fn send_ready(&self) -> bool {
        self.send_ready
    }

    pub fn set_send_ready(&mut self, ready: bool) {
        self.send_ready = ready;
    }

    /// Minimum interval to the next key update, refreshed to twice the
    /// RTO whenever an RTT sample lands.
    pub fn key_update_ts(&self) -> Duration {
        self.key_update_ts
    }

    pub fn set_key_update_ts(&mut self, period: Duration) {
        self.key_update_ts = period;
    }
}
