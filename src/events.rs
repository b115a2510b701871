//! Uplink events to the application
//!
//! The egress core reports stream transitions, migration and close
//! through an [`EventSink`]. Delivery can be refused (sink full,
//! subscriber gone); a refusal means the core must not apply the
//! corresponding state change, so the triggering frame stays linked and
//! the transition is retried on a later acknowledgment or purge.

use std::collections::VecDeque;

use crate::frame::FrameKind;
use crate::stream::{SendState, StreamId};

/// Events delivered up the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A stream's send half changed state.
    StreamUpdate {
        id: StreamId,
        state: SendState,
        errcode: u64,
    },
    /// The connection is closing with the given transport error.
    ConnectionClose {
        errcode: u64,
        frame: FrameKind,
        phrase: Option<String>,
    },
    /// A path validation succeeded and traffic is migrating.
    ConnectionMigration { local: bool },
    /// A full send buffer drained back below its limit; blocked writers
    /// can resume. `wspace` is the space now available.
    WriteSpace { wspace: u64 },
}

/// Receiver for uplink events.
pub trait EventSink: Send {
    /// Deliver one event. Returns false if the sink cannot take it; the
    /// caller must then leave its state untouched and retry later.
    fn deliver(&mut self, event: Event) -> bool;
}

/// Default sink: a bounded in-memory queue the host drains.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        EventQueue {
            events: VecDeque::new(),
            capacity,
        }
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new(64)
    }
}

impl EventSink for EventQueue {
    fn deliver(&mut self, event: Event) -> bool {
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push_back(event);
        true
    }
}
