//! Packet building interface
//!
//! The transmit pump talks to an opaque [`PacketBuilder`]: it proposes a
//! level and path for the next frame (`config`), appends frames until
//! one no longer fits (`tail`), seals the packet (`create`) and finally
//! bundles everything onto the wire (`flush`). Sealed packets flow back
//! to the egress core through `take_sealed` so it can stamp packet
//! numbers, start loss tracking and move frames to the transmitted list.
//!
//! [`PacketAssembler`] is the default implementation: a capacity model
//! that coalesces frames into MSS-bounded packets. Byte-level encoding
//! and encryption belong to the packet protection backend; packets
//! encrypted off-thread re-enter through `xmit`.

use std::mem;

use bytes::Bytes;
use tracing::debug;

use crate::frame::{Frame, Level};

/// Smallest UDP payload a QUIC endpoint may assume.
pub const MIN_UDP_PAYLOAD: u32 = 1200;
/// AEAD tag length appended to every protected packet.
pub const DEFAULT_TAGLEN: u32 = 16;

const LONG_HEADER_OVERHEAD: u32 = 28;
const SHORT_HEADER_OVERHEAD: u32 = 16;

/// Builder verdict for the frame proposed via `config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// Frame may be appended to the current packet.
    Proceed,
    /// Frame is filtered out; skip it and keep iterating.
    Filtered,
    /// The pass cannot continue (no route, level unusable).
    Stop,
}

/// A sealed packet awaiting number assignment and loss tracking.
#[derive(Debug)]
pub struct Packet {
    pub level: Level,
    pub path_alt: u8,
    pub ecn: bool,
    pub frames: Vec<Frame>,
    pub size: u32,
}

/// A packet already encrypted by the crypto worker, ready for the wire.
#[derive(Debug, Clone)]
pub struct EncryptedPacket {
    pub level: Level,
    pub path_alt: u8,
    pub data: Bytes,
}

/// The transmit pump's view of packet assembly.
pub trait PacketBuilder: Send {
    /// Prepare for a frame at `level` on the path selected by `path_alt`.
    fn config(&mut self, level: Level, path_alt: u8) -> ConfigOutcome;

    /// Append `frame` to the current packet. Returns the frame back when
    /// the packet is full; the caller seals and retries.
    fn tail(&mut self, frame: Frame, dgram: bool) -> Result<(), Frame>;

    /// Seal the packet under construction, if any.
    fn create(&mut self);

    /// Hand back every packet sealed since the last call.
    fn take_sealed(&mut self) -> Vec<Packet>;

    /// Seal anything pending and bundle all output onto the wire.
    /// Returns true if at least one packet went out this cycle.
    fn flush(&mut self) -> bool;

    /// Queue an externally encrypted packet for the wire.
    fn xmit(&mut self, packet: EncryptedPacket);

    fn mss(&self) -> u32;
    fn mss_update(&mut self, mss: u32);

    /// Restrict the next transmit cycle to `level`. Cleared by `flush`.
    fn set_filter(&mut self, level: Level, on: bool);

    fn taglen(&self) -> u32;
    fn set_taglen(&mut self, taglen: u32);

    /// Number of upcoming packets to mark ECN-capable.
    fn set_ecn_probes(&mut self, count: u32);
}

#[derive(Debug)]
struct BuildingPacket {
    level: Level,
    path_alt: u8,
    ecn: bool,
    frames: Vec<Frame>,
    used: u32,
}

/// Default MSS-bounded coalescing builder.
#[derive(Debug)]
pub struct PacketAssembler {
    mss: u32,
    taglen: u32,
    filter: Option<Level>,
    config: Option<(Level, u8)>,
    current: Option<BuildingPacket>,
    sealed: Vec<Packet>,
    emitted_since_flush: usize,
    ecn_probes: u32,
    wire: Vec<EncryptedPacket>,
    packets_sealed: u64,
}

impl PacketAssembler {
    pub fn new(mss: u32) -> Self {
        PacketAssembler {
            mss,
            taglen: DEFAULT_TAGLEN,
            filter: None,
            config: None,
            current: None,
            sealed: Vec::new(),
            emitted_since_flush: 0,
            ecn_probes: 0,
            wire: Vec::new(),
            packets_sealed: 0,
        }
    }

    fn header_overhead(level: Level) -> u32 {
        match level {
            Level::Initial | Level::Handshake => LONG_HEADER_OVERHEAD,
            Level::Application => SHORT_HEADER_OVERHEAD,
        }
    }

    fn space(&self, level: Level) -> u32 {
        self.mss
            .saturating_sub(Self::header_overhead(level))
            .saturating_sub(self.taglen)
    }

    fn seal_current(&mut self) {
        if let Some(pkt) = self.current.take() {
            let size = Self::header_overhead(pkt.level) + pkt.used + self.taglen;
            debug!(
                "packet sealed: level={} frames={} size={}",
                pkt.level,
                pkt.frames.len(),
                size
            );
            self.sealed.push(Packet {
                level: pkt.level,
                path_alt: pkt.path_alt,
                ecn: pkt.ecn,
                frames: pkt.frames,
                size,
            });
            self.packets_sealed += 1;
            self.emitted_since_flush += 1;
        }
    }

    /// Encrypted packets handed straight to the wire.
    pub fn wire(&self) -> &[EncryptedPacket] {
        &self.wire
    }

    /// Total packets sealed over the builder's lifetime.
    pub fn packets_sealed(&self) -> u64 {
        self.packets_sealed
    }
}

impl Default for PacketAssembler {
    fn default() -> Self {
        PacketAssembler::new(MIN_UDP_PAYLOAD)
    }
}

impl PacketBuilder for PacketAssembler {
    fn config(&mut self, level: Level, path_alt: u8) -> ConfigOutcome {
        if let Some(only) = self.filter {
            if level != only {
                return ConfigOutcome::Filtered;
            }
        }
        let switch = self
            .current
            .as_ref()
            .map_or(false, |cur| cur.level != level || cur.path_alt != path_alt);
        if switch {
            self.seal_current();
        }
        self.config = Some((level, path_alt));
        ConfigOutcome::Proceed
    }

    fn tail(&mut self, frame: Frame, _dgram: bool) -> Result<(), Frame> {
        let (level, path_alt) = match self.config {
            Some(cfg) => cfg,
            None => (frame.level, frame.path_alt),
        };
        let space = self.space(level);
        if self.current.is_none() {
            let ecn = self.ecn_probes > 0;
            self.ecn_probes = self.ecn_probes.saturating_sub(1);
            self.current = Some(BuildingPacket {
                level,
                path_alt,
                ecn,
                frames: Vec::new(),
                used: 0,
            });
        }
        let cur = match self.current.as_mut() {
            Some(cur) => cur,
            None => return Err(frame),
        };
        // An oversized frame (a PMTU probe) ships alone in its own packet.
        if cur.used + frame.len > space && !cur.frames.is_empty() {
            return Err(frame);
        }
        cur.used += frame.len;
        cur.frames.push(frame);
        Ok(())
    }

    fn create(&mut self) {
        self.seal_current();
    }

    fn take_sealed(&mut self) -> Vec<Packet> {
        mem::take(&mut self.sealed)
    }

    fn flush(&mut self) -> bool {
        self.seal_current();
        self.filter = None;
        self.config = None;
        let sent = self.emitted_since_flush > 0;
        self.emitted_since_flush = 0;
        sent
    }

    fn xmit(&mut self, packet: EncryptedPacket) {
        self.emitted_since_flush += 1;
        self.wire.push(packet);
    }

    fn mss(&self) -> u32 {
        self.mss
    }

    fn mss_update(&mut self, mss: u32) {
        debug!("mss updated to {}", mss);
        self.mss = mss;
    }

    fn set_filter(&mut self, level: Level, on: bool) {
        self.filter = if on { Some(level) } else { None };
    }

    fn taglen(&self) -> u32 {
        self.taglen
    }

    fn set_taglen(&mut self, taglen: u32) {
        self.taglen = taglen;
    }

    fn set_ecn_probes(&mut self, count: u32) {
        self.ecn_probes = count;
    }
}
