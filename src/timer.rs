//! Connection timer table
//!
//! Passive deadline registry for the per-level loss timers, the delayed
//! SACK timer and the path probe timer. The host drives the event loop:
//! it polls [`TimerTable::next_deadline`], sleeps until it passes, then
//! invokes the matching egress operation (`transmit_one` for loss,
//! `transmit_probe` for path).
//!
//! `reduce` is the loss-timer arming primitive: it only ever moves a
//! deadline earlier, so repeated arming is monotonic.

use std::time::Instant;

use crate::frame::Level;

const TIMER_MAX: usize = 5;

/// Timer identities, one slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Per-level loss/PTO timer
    Loss(Level),
    /// Delayed acknowledgment timer
    Sack,
    /// Path probe / PMTU raise timer
    Path,
}

impl TimerKind {
    fn index(self) -> usize {
        match self {
            TimerKind::Loss(level) => level.index(),
            TimerKind::Sack => 3,
            TimerKind::Path => 4,
        }
    }
}

/// Deadline table for one connection.
#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: [Option<Instant>; TIMER_MAX],
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` at `deadline` only if it is not already armed.
    pub fn start(&mut self, kind: TimerKind, deadline: Instant) {
        let slot = &mut self.deadlines[kind.index()];
        if slot.is_none() {
            *slot = Some(deadline);
        }
    }

    /// Arm `kind` at `deadline`, overwriting any previous deadline.
    pub fn reset(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.index()] = Some(deadline);
    }

    /// Arm `kind` at the earlier of its current deadline and `deadline`.
    pub fn reduce(&mut self, kind: TimerKind, deadline: Instant) {
        let slot = &mut self.deadlines[kind.index()];
        *slot = Some(match *slot {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }

    pub fn stop(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    pub fn expires_at(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }
}
