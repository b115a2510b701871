//! Send-side stream state
//!
//! The egress core only tracks the sending half of each stream: the send
//! state machine, flow-control accounting, and the count of in-flight
//! fragments. Receive-side state and data buffering live elsewhere in the
//! stack; frames refer back to their stream by id.

use std::collections::HashMap;

use tracing::debug;

/// Stream identifier
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Check if this is a client-initiated stream
    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    /// Check if this is a unidirectional stream
    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x2) == 2
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Send-side stream states (RFC 9000 Section 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Open, nothing queued yet
    Ready,
    /// Data queued or in flight
    Send,
    /// FIN queued; all data handed to the transmit path
    Sent,
    /// Everything acknowledged by the peer
    Recvd,
    /// RESET_STREAM queued or in flight
    ResetSent,
    /// RESET_STREAM acknowledged
    ResetRecvd,
}

/// Send-half accounting for one stream.
#[derive(Debug)]
pub struct SendHalf {
    pub state: SendState,
    /// Bytes handed to the packet builder so far
    pub bytes: u64,
    /// Peer-advertised stream send limit
    pub max_bytes: u64,
    /// Limit in force when the last STREAM_DATA_BLOCKED was emitted
    pub last_max_bytes: u64,
    /// Bytes-bearing frames currently queued or in flight
    pub frags: u32,
    /// A STREAM_DATA_BLOCKED frame is outstanding
    pub data_blocked: bool,
    /// Application error code carried by RESET_STREAM
    pub errcode: u64,
}

/// A stream as seen from the egress core.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub send: SendHalf,
}

impl Stream {
    pub fn new(id: StreamId, max_bytes: u64) -> Self {
        Stream {
            id,
            send: SendHalf {
                state: SendState::Ready,
                bytes: 0,
                max_bytes,
                last_max_bytes: 0,
                frags: 0,
                data_blocked: false,
                errcode: 0,
            },
        }
    }
}

/// Table of open streams plus the currently-active send stream.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<StreamId, Stream>,
    send_active: Option<StreamId>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream with its initial send limit. Returns the
    /// existing entry unchanged if the stream is already open.
    pub fn open(&mut self, id: StreamId, max_bytes: u64) -> &mut Stream {
        self.streams.entry(id).or_insert_with(|| {
            debug!("stream {} opened, send limit {}", id, max_bytes);
            Stream::new(id, max_bytes)
        })
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        if self.send_active == Some(id) {
            self.send_active = None;
        }
        self.streams.remove(&id)
    }

    /// The stream currently designated for application writes, if any.
    pub fn send_active(&self) -> Option<StreamId> {
        self.send_active
    }

    pub fn set_send_active(&mut self, id: Option<StreamId>) {
        self.send_active = id;
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
