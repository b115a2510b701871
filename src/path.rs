//! Path addresses and PMTU discovery state
//!
//! Each connection tracks a source and a destination [`Path`]: the
//! active address plus, during validation, an alternate one. The
//! destination path also carries the packetization-layer PMTU search
//! ([`PathMtu`]) driven by padded PING probes: the egress core records
//! the probe's packet number on send and confirms it from acknowledgment
//! ranges.

use std::net::SocketAddr;

use tracing::{debug, info};

/// Smallest PMTU every QUIC path must support.
pub const BASE_PLPMTU: u32 = 1200;
/// Search ceiling for the probe ladder.
pub const MAX_PLPMTU: u32 = 9000;
/// Probe size increment while searching upward.
const PL_STEP: u32 = 32;
/// Probes sent at one size before the search gives up on it.
const MAX_PROBES: u32 = 3;

/// Which of the connection's two paths an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSide {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MtuState {
    Search,
    Complete,
}

/// Feedback from processing an acknowledged probe.
#[derive(Debug, Clone, Copy)]
pub struct MtuFeedback {
    /// Newly validated PMTU, 0 if unchanged.
    pub pathmtu: u32,
    /// Search finished; arm the long raise timer.
    pub raise: bool,
    /// No further probe needed right now.
    pub complete: bool,
}

/// Packetization-layer PMTU search state.
#[derive(Debug)]
pub struct PathMtu {
    state: MtuState,
    pmtu: u32,
    probe_size: u32,
    probe_pn: Option<u64>,
    probe_count: u32,
    ceiling: u32,
}

impl Default for PathMtu {
    fn default() -> Self {
        PathMtu {
            state: MtuState::Search,
            pmtu: BASE_PLPMTU,
            probe_size: BASE_PLPMTU + PL_STEP,
            probe_pn: None,
            probe_count: 0,
            ceiling: MAX_PLPMTU,
        }
    }
}

impl PathMtu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validated PMTU for this path.
    pub fn pmtu(&self) -> u32 {
        self.pmtu
    }

    /// Size the next probe PING should be padded to.
    pub fn probe_size(&self) -> u32 {
        self.probe_size
    }

    /// Record that a probe of `probe_size` went out as packet `number`.
    ///
    /// Returns a PMTU to re-apply when repeated failures at this size end
    /// the upward search, 0 otherwise.
    pub fn send(&mut self, number: u64) -> u32 {
        self.probe_pn = Some(number);
        self.probe_count += 1;
        if self.probe_count > MAX_PROBES && self.state == MtuState::Search {
            debug!("pmtu search stops at {}, probe size {} unconfirmed", self.pmtu, self.probe_size);
            self.state = MtuState::Complete;
            self.probe_count = 0;
            self.probe_pn = None;
            return self.pmtu;
        }
        0
    }

    /// Whether the outstanding probe's packet number falls inside the
    /// acknowledged range `[smallest, largest]`.
    pub fn confirm(&self, largest: u64, smallest: u64) -> bool {
        self.probe_pn
            .map_or(false, |pn| pn >= smallest && pn <= largest)
    }

    /// Process a confirmed probe: raise the validated PMTU and pick the
    /// next probe size.
    pub fn recv(&mut self) -> MtuFeedback {
        self.probe_pn = None;
        self.probe_count = 0;
        self.pmtu = self.probe_size;
        if self.probe_size >= self.ceiling {
            self.state = MtuState::Complete;
            info!("pmtu search complete at {}", self.pmtu);
            return MtuFeedback { pathmtu: self.pmtu, raise: true, complete: true };
        }
        self.probe_size = (self.probe_size + PL_STEP).min(self.ceiling);
        MtuFeedback { pathmtu: self.pmtu, raise: false, complete: false }
    }

    /// Restart the upward search (after migration or a raise timer).
    pub fn restart(&mut self) {
        self.state = MtuState::Search;
        self.probe_size = (self.pmtu + PL_STEP).min(self.ceiling);
        self.probe_pn = None;
        self.probe_count = 0;
    }
}

/// One direction of the connection's 5-tuple: the active address and,
/// while a validation is running, the alternate one.
#[derive(Debug)]
pub struct Path {
    addrs: [Option<SocketAddr>; 2],
    udp_bind: bool,
    sent_cnt: u32,
    pl: PathMtu,
}

impl Path {
    /// `udp_bind` marks a locally-bound path: migrating it is a local
    /// rebind rather than a peer address change.
    pub fn new(active: Option<SocketAddr>, udp_bind: bool) -> Self {
        Path {
            addrs: [active, None],
            udp_bind,
            sent_cnt: 0,
            pl: PathMtu::new(),
        }
    }

    pub fn active(&self) -> Option<SocketAddr> {
        self.addrs[0]
    }

    pub fn alternate(&self) -> Option<SocketAddr> {
        self.addrs[1]
    }

    /// Install an alternate address to validate.
    pub fn set_alternate(&mut self, addr: SocketAddr) {
        self.addrs[1] = Some(addr);
    }

    /// Promote the alternate address to active.
    pub fn swap_active(&mut self) {
        self.addrs.swap(0, 1);
    }

    /// Drop the (now stale) alternate address.
    pub fn free_alt(&mut self) {
        self.addrs[1] = None;
    }

    pub fn udp_bind(&self) -> bool {
        self.udp_bind
    }

    pub fn sent_cnt(&self) -> u32 {
        self.sent_cnt
    }

    pub fn set_sent_cnt(&mut self, count: u32) {
        self.sent_cnt = count;
    }

    pub fn pl(&self) -> &PathMtu {
        &self.pl
    }

    pub fn pl_mut(&mut self) -> &mut PathMtu {
        &mut self.pl
    }
}
