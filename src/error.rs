//! QUIC error types

use thiserror::Error;

/// QUIC transport error codes (RFC 9000 Section 20.1) cached on the
/// outqueue for CONNECTION_CLOSE frames.
pub mod transport_error {
    pub const NO_ERROR: u64 = 0x00;
    pub const INTERNAL_ERROR: u64 = 0x01;
    pub const FLOW_CONTROL_ERROR: u64 = 0x03;
    pub const PROTOCOL_VIOLATION: u64 = 0x0a;
    pub const APPLICATION_ERROR: u64 = 0x0c;
}

/// Errors surfaced by the egress core.
///
/// Enqueue operations never fail; backpressure is expressed by frames
/// staying on their queue. Errors here come from the async transmit path
/// and from configuration.
#[derive(Error, Debug, Clone)]
pub enum QuicError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Flow control error: {0}")]
    FlowControl(String),

    #[error("Crypto worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, QuicError>;
