//! Outbound frame representation
//!
//! A [`Frame`] is the unit of work flowing through the egress core: built
//! by the sender paths, queued for transmission, handed to the packet
//! builder, tracked on the transmitted list until acknowledged or declared
//! lost. Wire encoding belongs to the packet builder; the fields here are
//! the scheduling and accounting metadata.

use std::time::Instant;

use bytes::Bytes;

use crate::stream::StreamId;

/// Frame targets the alternate source address (local rebind in progress).
pub const PATH_ALT_SRC: u8 = 0x01;
/// Frame targets the alternate destination address (peer migration).
pub const PATH_ALT_DST: u8 = 0x02;

/// Encryption levels, each with its own packet-number space, keys and
/// loss timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Initial,
    Handshake,
    Application,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Initial, Level::Handshake, Level::Application];

    /// Dense index for per-level state arrays.
    pub fn index(self) -> usize {
        match self {
            Level::Initial => 0,
            Level::Handshake => 1,
            Level::Application => 2,
        }
    }

    /// Queue precedence: higher goes earlier on the control and
    /// transmitted lists. Application data always yields to handshake
    /// traffic.
    pub fn precedence(self) -> u8 {
        match self {
            Level::Application => 0,
            Level::Initial => 1,
            Level::Handshake => 2,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Initial => write!(f, "initial"),
            Level::Handshake => write!(f, "handshake"),
            Level::Application => write!(f, "application"),
        }
    }
}

/// Frame kinds routed by the egress core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Ping,
    Crypto,
    Stream,
    Datagram,
    ResetStream,
    StopSending,
    MaxData,
    MaxStreamData,
    DataBlocked,
    StreamDataBlocked,
    ConnectionClose,
    ConnectionCloseApp,
    HandshakeDone,
}

impl FrameKind {
    /// Datagram frames are never retransmitted.
    pub fn is_dgram(self) -> bool {
        self == FrameKind::Datagram
    }

    pub fn is_stream(self) -> bool {
        self == FrameKind::Stream
    }
}

/// A queued outbound frame.
///
/// `bytes` is the payload count charged against flow control and the
/// congestion window (0 for pure control frames); `len` is the wire
/// length charged against per-level inflight. `number` and `transmit_ts`
/// are filled in when the packet carrying the frame is sealed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub level: Level,
    pub fin: bool,
    pub bytes: u32,
    pub len: u32,
    pub offset: u64,
    pub stream_id: Option<StreamId>,
    pub path_alt: u8,
    pub ecn: bool,
    pub number: u64,
    pub transmit_ts: Option<Instant>,
    pub payload: Bytes,
}

// Rough wire-length estimates for control frames: type byte plus varint
// fields. Exact layout belongs to the packet builder.
const PING_LEN: u32 = 1;
const BLOCKED_LEN: u32 = 9;
const STREAM_BLOCKED_LEN: u32 = 17;
const RESET_STREAM_LEN: u32 = 13;
const CLOSE_LEN: u32 = 11;
const STREAM_OVERHEAD: u32 = 8;
const DATAGRAM_OVERHEAD: u32 = 4;
const CRYPTO_OVERHEAD: u32 = 8;

impl Frame {
    fn control(kind: FrameKind, level: Level, len: u32) -> Self {
        Frame {
            kind,
            level,
            fin: false,
            bytes: 0,
            len,
            offset: 0,
            stream_id: None,
            path_alt: 0,
            ecn: false,
            number: 0,
            transmit_ts: None,
            payload: Bytes::new(),
        }
    }

    /// A STREAM frame carrying `payload` at `offset`.
    pub fn stream(id: StreamId, offset: u64, payload: Bytes, fin: bool) -> Self {
        let bytes = payload.len() as u32;
        Frame {
            kind: FrameKind::Stream,
            level: Level::Application,
            fin,
            bytes,
            len: bytes + STREAM_OVERHEAD,
            offset,
            stream_id: Some(id),
            path_alt: 0,
            ecn: false,
            number: 0,
            transmit_ts: None,
            payload,
        }
    }

    /// An unreliable DATAGRAM frame.
    pub fn datagram(payload: Bytes) -> Self {
        let bytes = payload.len() as u32;
        Frame {
            kind: FrameKind::Datagram,
            level: Level::Application,
            fin: false,
            bytes,
            len: bytes + DATAGRAM_OVERHEAD,
            offset: 0,
            stream_id: None,
            path_alt: 0,
            ecn: false,
            number: 0,
            transmit_ts: None,
            payload,
        }
    }

    /// A CRYPTO frame carrying handshake data at `level`.
    pub fn crypto(level: Level, offset: u64, payload: Bytes) -> Self {
        let mut frame =
            Frame::control(FrameKind::Crypto, level, payload.len() as u32 + CRYPTO_OVERHEAD);
        frame.offset = offset;
        frame.payload = payload;
        frame
    }

    /// A PING frame padded to `size` wire bytes. Used both as a bare
    /// liveness probe and, sized up, as a path-MTU probe.
    pub fn ping(size: u32) -> Self {
        Frame::control(FrameKind::Ping, Level::Application, size.max(PING_LEN))
    }

    /// A DATA_BLOCKED frame reporting the connection send limit.
    pub fn data_blocked(_max_data: u64) -> Self {
        Frame::control(FrameKind::DataBlocked, Level::Application, BLOCKED_LEN)
    }

    /// A STREAM_DATA_BLOCKED frame reporting `id`'s send limit.
    pub fn stream_data_blocked(id: StreamId, _max_stream_data: u64) -> Self {
        let mut frame =
            Frame::control(FrameKind::StreamDataBlocked, Level::Application, STREAM_BLOCKED_LEN);
        frame.stream_id = Some(id);
        frame
    }

    /// A RESET_STREAM frame for `id`. The error code travels via the
    /// stream's send state.
    pub fn reset_stream(id: StreamId) -> Self {
        let mut frame = Frame::control(FrameKind::ResetStream, Level::Application, RESET_STREAM_LEN);
        frame.stream_id = Some(id);
        frame
    }

    /// A CONNECTION_CLOSE (or CONNECTION_CLOSE_APP) frame at `level`.
    pub fn connection_close(kind: FrameKind, level: Level, phrase: Option<&str>) -> Self {
        let phrase_len = phrase.map(|p| p.len() as u32).unwrap_or(0);
        Frame::control(kind, level, CLOSE_LEN + phrase_len)
    }
}
