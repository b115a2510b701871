//! quic-egress: the outbound transmission core of a QUIC endpoint
//!
//! This crate takes application stream data, datagrams and control
//! signals produced elsewhere in a QUIC stack and turns them into
//! scheduled, tracked, retransmittable packets:
//!
//! - four ordered frame queues with handshake-before-application
//!   discipline ([`outq`])
//! - a transmit pump coalescing frames into MSS-bounded packets through
//!   an opaque builder ([`packet`])
//! - per-stream and connection flow-control gating with BLOCKED
//!   signaling ([`stream`], [`outq`])
//! - acknowledgment processing, RTT sampling and NewReno congestion
//!   control ([`cong`])
//! - per-level loss detection and retransmission ordering ([`pnmap`],
//!   [`timer`])
//! - path-MTU probing and connection migration ([`path`])
//! - a tokio-based tail for packets encrypted off-thread ([`worker`])
//!
//! Packet encoding, TLS, and the receive path live with the rest of the
//! stack; this crate only schedules and accounts for what goes out.

// Outbound queues and the connection-level driver
pub mod outq;

// Frame metadata and encryption levels
pub mod frame;

// Send-side stream state
pub mod stream;

// Congestion control and RTT estimation
pub mod cong;

// Per-level packet-number bookkeeping
pub mod pnmap;

// Per-level crypto readiness
pub mod crypto;

// Packet building interface and the default assembler
pub mod packet;

// Path addresses and PMTU discovery
pub mod path;

// Connection timers
pub mod timer;

// Uplink events to the application
pub mod events;

// Send-buffer accounting
pub mod wmem;

// Async encrypted-packet handoff
pub mod worker;

// Error types
pub mod error;

// Re-export main types for easier usage
pub use error::{QuicError, Result};
pub use events::{Event, EventQueue, EventSink};
pub use frame::{Frame, FrameKind, Level, PATH_ALT_DST, PATH_ALT_SRC};
pub use outq::{
    ConnState, Egress, EgressConfig, Outqueue, QueueKind, TransportParameters,
    PACKET_REORDER_THRESHOLD,
};
pub use packet::{ConfigOutcome, EncryptedPacket, Packet, PacketAssembler, PacketBuilder};
pub use path::{Path, PathMtu, PathSide};
pub use pnmap::PacketNumberMap;
pub use stream::{SendState, Stream, StreamId, StreamTable};
pub use timer::{TimerKind, TimerTable};
pub use worker::{spawn_crypto_tail, EncryptedTail};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    pub use crate::events::{Event, EventSink};
    pub use crate::frame::{Frame, FrameKind, Level};
    pub use crate::outq::{ConnState, Egress, EgressConfig, TransportParameters};
    pub use crate::packet::{EncryptedPacket, PacketBuilder};
    pub use crate::stream::{SendState, StreamId};
    pub use anyhow::Result;
}
