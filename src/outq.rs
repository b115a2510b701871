//! Outbound transmission core
//!
//! [`Egress`] owns the four outbound frame queues and drives everything
//! that happens to a frame after the sender paths build it: scheduling
//! into packets under congestion, flow-control and key-readiness
//! constraints, inflight tracking, acknowledgment processing, loss
//! marking and retransmission, PMTU probing, connection migration and
//! close.
//!
//! The queues keep a strict discipline: handshake-level frames always
//! precede application-level frames on the control and transmitted
//! lists, and retransmitted stream frames re-enter the stream queue
//! ordered by (level, offset). Acknowledgments walk the transmitted list
//! most-recent-first; the single frame matching the ACK's own largest
//! number feeds the RTT estimator.
//!
//! All operations expect the caller to serialize access (one connection,
//! one lock) and take the current time as a parameter, so timer-driven
//! paths stay deterministic under test.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cong::CongestionController;
use crate::crypto::CryptoState;
use crate::error::transport_error;
use crate::events::{Event, EventQueue, EventSink};
use crate::frame::{Frame, FrameKind, Level, PATH_ALT_DST, PATH_ALT_SRC};
use crate::packet::{
    ConfigOutcome, EncryptedPacket, PacketAssembler, PacketBuilder, MIN_UDP_PAYLOAD,
};
use crate::path::{Path, PathSide};
use crate::pnmap::PacketNumberMap;
use crate::stream::{SendState, StreamId, StreamTable};
use crate::timer::{TimerKind, TimerTable};
use crate::wmem::WriteMemory;

/// Reordering distance: a packet this far behind the highest
/// acknowledged number is loss-suspect even before its RTO expires.
pub const PACKET_REORDER_THRESHOLD: u64 = 6;

/// Connection lifecycle as seen by the egress core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Establishing,
    Established,
    Closed,
}

/// Peer-advertised transport parameters merged by [`Egress::set_param`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportParameters {
    pub max_data: u64,
    pub max_datagram_frame_size: u32,
    pub max_udp_payload_size: u32,
    pub ack_delay_exponent: u8,
    pub max_idle_timeout: Duration,
    pub max_ack_delay: Duration,
    pub grease_quic_bit: bool,
    pub disable_1rtt_encryption: bool,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            max_data: 64 * 1024,
            max_datagram_frame_size: 0,
            max_udp_payload_size: 65527,
            ack_delay_exponent: 3,
            max_idle_timeout: Duration::ZERO,
            max_ack_delay: Duration::from_millis(25),
            grease_quic_bit: false,
            disable_1rtt_encryption: false,
        }
    }
}

/// One of the four egress frame queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Stream,
    Datagram,
    Control,
    Transmitted,
}

/// Queues and accounting for the outbound direction of one connection.
#[derive(Debug)]
pub struct Outqueue {
    stream_list: VecDeque<Frame>,
    datagram_list: VecDeque<Frame>,
    control_list: VecDeque<Frame>,
    transmitted_list: VecDeque<Frame>,

    /// Congestion window, mirrored from the controller after updates.
    window: u64,
    /// Payload bytes handed to the packet builder, against `max_bytes`.
    bytes: u64,
    /// Connection-level send limit advertised by the peer.
    max_bytes: u64,
    /// Limit in force when the last DATA_BLOCKED went out.
    last_max_bytes: u64,
    /// Payload bytes in flight, gated by `window`.
    data_inflight: u64,
    /// Wire bytes in flight across all levels.
    inflight: u64,
    /// A DATA_BLOCKED frame is outstanding.
    data_blocked: bool,
    /// The flow-control gate queued control frames mid-cycle; run one
    /// extra control pass before flushing.
    ctrl_dirty: bool,
    /// Consecutive loss-timer fires without forward progress.
    rtx_count: u32,
    /// Level fresh application data is sent at.
    data_level: Level,

    max_datagram_frame_size: u32,
    max_udp_payload_size: u32,
    ack_delay_exponent: u8,
    max_idle_timeout: Duration,
    max_ack_delay: Duration,
    grease_quic_bit: bool,
    disable_1rtt_encryption: bool,

    close_errcode: u64,
    close_frame: FrameKind,
    close_phrase: Option<String>,
}

impl Outqueue {
    fn new(window: u64, max_bytes: u64) -> Self {
        Outqueue {
            stream_list: VecDeque::new(),
            datagram_list: VecDeque::new(),
            control_list: VecDeque::new(),
            transmitted_list: VecDeque::new(),
            window,
            bytes: 0,
            max_bytes,
            last_max_bytes: 0,
            data_inflight: 0,
            inflight: 0,
            data_blocked: false,
            ctrl_dirty: false,
            rtx_count: 0,
            data_level: Level::Application,
            max_datagram_frame_size: 0,
            max_udp_payload_size: 65527,
            ack_delay_exponent: 3,
            max_idle_timeout: Duration::ZERO,
            max_ack_delay: Duration::from_millis(25),
            grease_quic_bit: false,
            disable_1rtt_encryption: false,
            close_errcode: 0,
            close_frame: FrameKind::ConnectionClose,
            close_phrase: None,
        }
    }

    /// Insert keeping handshake-level frames ahead of application-level
    /// ones.
    fn priority_insert(list: &mut VecDeque<Frame>, frame: Frame) {
        if frame.level != Level::Application {
            let at = list
                .iter()
                .position(|pos| pos.level == Level::Application)
                .unwrap_or(list.len());
            list.insert(at, frame);
        } else {
            list.push_back(frame);
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn data_inflight(&self) -> u64 {
        self.data_inflight
    }

    pub fn inflight(&self) -> u64 {
        self.inflight
    }

    pub fn data_blocked(&self) -> bool {
        self.data_blocked
    }

    pub fn rtx_count(&self) -> u32 {
        self.rtx_count
    }

    pub fn data_level(&self) -> Level {
        self.data_level
    }

    pub fn max_datagram_frame_size(&self) -> u32 {
        self.max_datagram_frame_size
    }

    pub fn max_udp_payload_size(&self) -> u32 {
        self.max_udp_payload_size
    }

    pub fn ack_delay_exponent(&self) -> u8 {
        self.ack_delay_exponent
    }

    pub fn max_idle_timeout(&self) -> Duration {
        self.max_idle_timeout
    }

    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    pub fn grease_quic_bit(&self) -> bool {
        self.grease_quic_bit
    }

    pub fn close_errcode(&self) -> u64 {
        self.close_errcode
    }

    pub fn close_frame(&self) -> FrameKind {
        self.close_frame
    }

    pub fn close_phrase(&self) -> Option<&str> {
        self.close_phrase.as_deref()
    }

    pub fn stream_queue(&self) -> impl Iterator<Item = &Frame> {
        self.stream_list.iter()
    }

    pub fn datagram_queue(&self) -> impl Iterator<Item = &Frame> {
        self.datagram_list.iter()
    }

    pub fn control_queue(&self) -> impl Iterator<Item = &Frame> {
        self.control_list.iter()
    }

    pub fn transmitted(&self) -> impl Iterator<Item = &Frame> {
        self.transmitted_list.iter()
    }
}

/// Construction-time knobs for [`Egress`].
#[derive(Debug, Clone)]
pub struct EgressConfig {
    pub mss: u32,
    pub sndbuf: u64,
    /// Connection send limit before the peer's parameters arrive.
    pub initial_max_data: u64,
    pub probe_timeout: Duration,
    pub max_idle_timeout: Duration,
    pub disable_1rtt_encryption: bool,
    pub event_capacity: usize,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        EgressConfig {
            mss: MIN_UDP_PAYLOAD,
            sndbuf: 256 * 1024,
            initial_max_data: 64 * 1024,
            probe_timeout: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            disable_1rtt_encryption: false,
            event_capacity: 64,
            local_addr: None,
            peer_addr: None,
        }
    }
}

/// The connection-level egress driver: the outqueue plus every
/// collaborator the transmit, acknowledgment and loss paths touch.
#[derive(Debug)]
pub struct Egress<B = PacketAssembler, E = EventQueue> {
    state: ConnState,
    outq: Outqueue,
    streams: StreamTable,
    cong: CongestionController,
    pnmap: [PacketNumberMap; 3],
    crypto: [CryptoState; 3],
    src_path: Path,
    dst_path: Path,
    timers: TimerTable,
    wmem: WriteMemory,
    builder: B,
    events: E,
    probe_timeout: Duration,
    local_max_idle_timeout: Duration,
    local_disable_1rtt_encryption: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    /// Outgoing ECN codepoint, enabled by acknowledged ECN-marked
    /// packets on the active path and cleared on migration.
    ecn_ect0: bool,
}

impl Egress {
    /// Build an egress with the default packet assembler and event queue.
    pub fn new(config: EgressConfig) -> Self {
        let builder = PacketAssembler::new(config.mss);
        let events = EventQueue::new(config.event_capacity);
        Egress::with_parts(config, builder, events)
    }
}

impl<B: PacketBuilder, E: EventSink> Egress<B, E> {
    /// Build an egress around a caller-supplied packet builder and event
    /// sink.
    pub fn with_parts(config: EgressConfig, builder: B, events: E) -> Self {
        let cong = CongestionController::new(config.mss);
        let window = cong.window();
        Egress {
            state: ConnState::Establishing,
            outq: Outqueue::new(window, config.initial_max_data),
            streams: StreamTable::new(),
            cong,
            pnmap: Default::default(),
            crypto: Default::default(),
            src_path: Path::new(config.local_addr, true),
            dst_path: Path::new(config.peer_addr, false),
            timers: TimerTable::new(),
            wmem: WriteMemory::new(config.sndbuf),
            builder,
            events,
            probe_timeout: config.probe_timeout,
            local_max_idle_timeout: config.max_idle_timeout,
            local_disable_1rtt_encryption: config.disable_1rtt_encryption,
            local_addr: config.local_addr,
            peer_addr: config.peer_addr,
            ecn_ect0: false,
        }
    }

    // ---- enqueue entry points --------------------------------------

    /// Queue a stream frame; transmits immediately unless `cork`ed.
    pub fn stream_tail(&mut self, frame: Frame, cork: bool, now: Instant) {
        if let Some(id) = frame.stream_id {
            if let Some(stream) = self.streams.get_mut(id) {
                if stream.send.state == SendState::Ready {
                    stream.send.state = SendState::Send;
                }
            }
            let fin_sent = frame.fin
                && self
                    .streams
                    .get(id)
                    .map_or(false, |s| s.send.state == SendState::Send);
            if fin_sent {
                if self.streams.send_active() == Some(id) {
                    self.streams.set_send_active(None);
                }
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.send.state = SendState::Sent;
                }
            }
        }
        self.wmem.charge(frame.bytes);
        self.outq.stream_list.push_back(frame);
        if !cork {
            self.transmit(now);
        }
    }

    /// Queue a datagram frame; transmits immediately unless `cork`ed.
    pub fn dgram_tail(&mut self, frame: Frame, cork: bool, now: Instant) {
        self.wmem.charge(frame.bytes);
        self.outq.datagram_list.push_back(frame);
        if !cork {
            self.transmit(now);
        }
    }

    /// Queue a control frame, keeping handshake levels ahead of 1-RTT;
    /// transmits immediately unless `cork`ed.
    pub fn ctrl_tail(&mut self, frame: Frame, cork: bool, now: Instant) {
        self.wmem.charge(frame.bytes);
        Outqueue::priority_insert(&mut self.outq.control_list, frame);
        if !cork {
            self.transmit(now);
        }
    }

    /// Track a sent frame until it is acknowledged or declared lost.
    pub fn transmitted_tail(&mut self, frame: Frame) {
        Outqueue::priority_insert(&mut self.outq.transmitted_list, frame);
    }

    // ---- transmit pump ---------------------------------------------

    /// Pack and transmit queued frames. Returns true if anything went
    /// out on the wire.
    pub fn transmit(&mut self, now: Instant) -> bool {
        self.transmit_ctrl();
        self.transmit_dgram();
        self.transmit_stream();
        if self.outq.ctrl_dirty {
            // BLOCKED frames queued by the flow gate ship in this cycle.
            self.outq.ctrl_dirty = false;
            self.transmit_ctrl();
        }
        let sent = self.builder.flush();
        self.absorb_sealed(now);
        for level in Level::ALL {
            self.update_loss_timer(level, now);
        }
        sent
    }

    fn transmit_ctrl(&mut self) {
        let mut i = 0;
        while i < self.outq.control_list.len() {
            let (level, path_alt) = {
                let frame = &self.outq.control_list[i];
                (frame.level, frame.path_alt)
            };
            if !self.crypto[level.index()].send_ready() {
                break;
            }
            match self.builder.config(level, path_alt) {
                ConfigOutcome::Filtered => {
                    i += 1;
                    continue;
                }
                ConfigOutcome::Stop => break,
                ConfigOutcome::Proceed => {}
            }
            let Some(frame) = self.outq.control_list.remove(i) else {
                break;
            };
            match self.builder.tail(frame, false) {
                Ok(()) => {}
                Err(frame) => {
                    // Packet full: seal it and retry this frame in the
                    // next one.
                    self.outq.control_list.insert(i, frame);
                    self.builder.create();
                }
            }
        }
    }

    fn transmit_dgram(&mut self) {
        let level = self.outq.data_level;
        if !self.crypto[level.index()].send_ready() {
            return;
        }
        let mut i = 0;
        while i < self.outq.datagram_list.len() {
            let (flen, fbytes, path_alt) = {
                let frame = &self.outq.datagram_list[i];
                (u64::from(frame.len), u64::from(frame.bytes), frame.path_alt)
            };
            if self.outq.data_inflight + flen > self.outq.window {
                break;
            }
            match self.builder.config(level, path_alt) {
                ConfigOutcome::Filtered => {
                    i += 1;
                    continue;
                }
                ConfigOutcome::Stop => break,
                ConfigOutcome::Proceed => {}
            }
            let Some(frame) = self.outq.datagram_list.remove(i) else {
                break;
            };
            match self.builder.tail(frame, true) {
                Ok(()) => {
                    self.outq.data_inflight += fbytes;
                }
                Err(frame) => {
                    self.outq.datagram_list.insert(i, frame);
                    self.builder.create();
                }
            }
        }
    }

    fn transmit_stream(&mut self) {
        let level = self.outq.data_level;
        if !self.crypto[level.index()].send_ready() {
            return;
        }
        let mut i = 0;
        while i < self.outq.stream_list.len() {
            let (fbytes, sid, path_alt) = {
                let frame = &self.outq.stream_list[i];
                (u64::from(frame.bytes), frame.stream_id, frame.path_alt)
            };
            if level == Level::Application {
                if let Some(id) = sid {
                    if self.flow_control(fbytes, id) {
                        break;
                    }
                }
            }
            match self.builder.config(level, path_alt) {
                ConfigOutcome::Filtered => {
                    i += 1;
                    continue;
                }
                ConfigOutcome::Stop => break,
                ConfigOutcome::Proceed => {}
            }
            let Some(frame) = self.outq.stream_list.remove(i) else {
                break;
            };
            match self.builder.tail(frame, false) {
                Ok(()) => {
                    if let Some(id) = sid {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.send.frags += 1;
                            stream.send.bytes += fbytes;
                        }
                    }
                    self.outq.bytes += fbytes;
                    self.outq.data_inflight += fbytes;
                }
                Err(frame) => {
                    self.outq.stream_list.insert(i, frame);
                    self.builder.create();
                }
            }
        }
    }

    /// Per-frame send gate: congestion window, stream limit, connection
    /// limit. Queues BLOCKED frames when a flow limit stalls the stream
    /// and marks the control queue dirty so they ship this cycle.
    fn flow_control(&mut self, len: u64, id: StreamId) -> bool {
        let mut blocked = false;
        let mut produced = false;

        // Congestion stalls are silent; the peer learns nothing new.
        if self.outq.data_inflight + len > self.outq.window {
            blocked = true;
        }

        if let Some(stream) = self.streams.get_mut(id) {
            if stream.send.bytes + len > stream.send.max_bytes {
                if !stream.send.data_blocked
                    && stream.send.last_max_bytes < stream.send.max_bytes
                {
                    let frame = Frame::stream_data_blocked(id, stream.send.max_bytes);
                    debug!(
                        "stream {} blocked at limit {}",
                        id, stream.send.max_bytes
                    );
                    stream.send.last_max_bytes = stream.send.max_bytes;
                    stream.send.data_blocked = true;
                    Outqueue::priority_insert(&mut self.outq.control_list, frame);
                    produced = true;
                }
                blocked = true;
            }
        }

        if self.outq.bytes + len > self.outq.max_bytes {
            if !self.outq.data_blocked && self.outq.last_max_bytes < self.outq.max_bytes {
                let frame = Frame::data_blocked(self.outq.max_bytes);
                debug!("connection blocked at limit {}", self.outq.max_bytes);
                self.outq.last_max_bytes = self.outq.max_bytes;
                self.outq.data_blocked = true;
                Outqueue::priority_insert(&mut self.outq.control_list, frame);
                produced = true;
            }
            blocked = true;
        }

        if produced {
            self.outq.ctrl_dirty = true;
        }
        blocked
    }

    /// Pull sealed packets out of the builder: assign packet numbers,
    /// stamp send times, start inflight tracking and move the frames to
    /// the transmitted list.
    fn absorb_sealed(&mut self, now: Instant) {
        for packet in self.builder.take_sealed() {
            let idx = packet.level.index();
            let number = self.pnmap[idx].advance();
            self.pnmap[idx].set_last_sent_ts(now);
            debug!(
                "packet {} out: level={} frames={} size={}",
                number,
                packet.level,
                packet.frames.len(),
                packet.size
            );
            for mut frame in packet.frames {
                frame.number = number;
                frame.transmit_ts = Some(now);
                frame.ecn = packet.ecn;
                self.pnmap[idx].inc_inflight(frame.len);
                self.outq.inflight += u64::from(frame.len);
                self.transmitted_tail(frame);
            }
        }
    }

    // ---- acknowledgment processing ---------------------------------

    /// Retire the acknowledged range `[smallest, largest]` at `level`.
    /// `ack_largest` is the ACK frame's own largest number and supplies
    /// the RTT sample. Returns the payload bytes acknowledged.
    pub fn transmitted_sack(
        &mut self,
        level: Level,
        smallest: u64,
        largest: u64,
        ack_largest: u64,
        ack_delay: Duration,
        now: Instant,
    ) -> u64 {
        if self.dst_path.pl().confirm(largest, smallest) {
            let feedback = self.dst_path.pl_mut().recv();
            if feedback.pathmtu > 0 {
                let taglen = self.builder.taglen();
                self.builder.mss_update(feedback.pathmtu + taglen);
            }
            if !feedback.complete {
                self.transmit_probe(now);
            }
            if feedback.raise {
                // Reuse the probe timer as the long raise timer.
                self.timers
                    .reset(TimerKind::Path, now + self.probe_timeout * 30);
            }
        }

        let idx = level.index();
        let mut acked_bytes: u64 = 0;
        let mut acked_number: Option<(u64, Instant)> = None;

        let mut i = self.outq.transmitted_list.len();
        while i > 0 {
            i -= 1;
            let (fkind, flevel, fnum, fts, fbytes, flen, fecn, fsid) = {
                let frame = &self.outq.transmitted_list[i];
                (
                    frame.kind,
                    frame.level,
                    frame.number,
                    frame.transmit_ts,
                    frame.bytes,
                    frame.len,
                    frame.ecn,
                    frame.stream_id,
                )
            };
            if flevel != level {
                continue;
            }
            if fnum > largest {
                continue;
            }
            if fnum < smallest {
                break;
            }

            if fnum == ack_largest {
                if let Some(ts) = fts {
                    self.cong.rtt_update(ts, ack_delay, now);
                }
                let rto = self.cong.rto();
                self.pnmap[idx].set_max_record_ts(rto * 2);
                self.crypto[idx].set_key_update_ts(rto * 2);
            }
            if acked_number.is_none() {
                acked_number = Some((fnum, fts.unwrap_or(now)));
            }
            if fecn {
                self.ecn_ect0 = true;
            }

            if fbytes > 0 {
                if let Some(id) = fsid {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.send.frags = stream.send.frags.saturating_sub(1);
                        if stream.send.frags == 0 && stream.send.state == SendState::Sent {
                            let event = Event::StreamUpdate {
                                id,
                                state: SendState::Recvd,
                                errcode: 0,
                            };
                            if self.events.deliver(event) {
                                stream.send.state = SendState::Recvd;
                            } else {
                                // Uplink refused: undo and leave the frame
                                // linked so a later ack retries.
                                stream.send.frags += 1;
                                continue;
                            }
                        }
                    }
                }
            } else {
                match fkind {
                    FrameKind::ResetStream => {
                        if let Some(id) = fsid {
                            if let Some(stream) = self.streams.get_mut(id) {
                                let event = Event::StreamUpdate {
                                    id,
                                    state: SendState::ResetRecvd,
                                    errcode: stream.send.errcode,
                                };
                                if self.events.deliver(event) {
                                    stream.send.state = SendState::ResetRecvd;
                                } else {
                                    continue;
                                }
                            }
                        }
                    }
                    FrameKind::StreamDataBlocked => {
                        if let Some(id) = fsid {
                            if let Some(stream) = self.streams.get_mut(id) {
                                stream.send.data_blocked = false;
                            }
                        }
                    }
                    FrameKind::DataBlocked => {
                        self.outq.data_blocked = false;
                    }
                    _ => {}
                }
            }

            self.pnmap[idx].set_max_pn_acked(fnum);
            acked_bytes += u64::from(fbytes);
            self.pnmap[idx].dec_inflight(flen);
            self.outq.data_inflight = self.outq.data_inflight.saturating_sub(u64::from(fbytes));
            self.outq.inflight = self.outq.inflight.saturating_sub(u64::from(flen));
            if let Some(frame) = self.outq.transmitted_list.remove(i) {
                self.free_frame(frame);
            }
        }

        self.outq.rtx_count = 0;
        if acked_bytes > 0 {
            if let Some((number, transmit_ts)) = acked_number {
                self.cong.cwnd_update_after_sack(
                    number,
                    transmit_ts,
                    acked_bytes,
                    self.outq.data_inflight,
                );
                self.outq.window = self.cong.window();
            }
        }
        self.update_loss_timer(level, now);
        debug!(
            "sack level={} range=[{}..{}] retired {} bytes",
            level, smallest, largest, acked_bytes
        );
        acked_bytes
    }

    // ---- loss engine -----------------------------------------------

    /// Scan `level`'s transmitted frames and move the lost ones back to
    /// the outbound queues (`immediate` skips the RTO/reordering check).
    /// Returns how many frames were marked lost.
    pub fn retransmit_mark(&mut self, level: Level, immediate: bool, now: Instant) -> u32 {
        let idx = level.index();
        self.pnmap[idx].set_loss_ts(None);
        let last = self.pnmap[idx].next_number() - 1;
        let rto = self.cong.rto();
        let mut count = 0;
        let mut i = 0;
        while i < self.outq.transmitted_list.len() {
            let (fkind, flevel, fnum, fts, fbytes, flen) = {
                let frame = &self.outq.transmitted_list[i];
                (
                    frame.kind,
                    frame.level,
                    frame.number,
                    frame.transmit_ts,
                    frame.bytes,
                    frame.len,
                )
            };
            if flevel != level {
                i += 1;
                continue;
            }
            let transmit_ts = fts.unwrap_or(now);
            if !immediate
                && transmit_ts + rto > now
                && fnum + PACKET_REORDER_THRESHOLD > self.pnmap[idx].max_pn_acked()
            {
                // Not lost yet; remember when it will be.
                self.pnmap[idx].set_loss_ts(Some(transmit_ts + rto));
                break;
            }
            self.pnmap[idx].dec_inflight(flen);
            self.outq.data_inflight = self.outq.data_inflight.saturating_sub(u64::from(fbytes));
            self.outq.inflight = self.outq.inflight.saturating_sub(u64::from(flen));
            let Some(frame) = self.outq.transmitted_list.remove(i) else {
                break;
            };
            if fkind.is_dgram() {
                // Stale realtime data; datagrams are never retransmitted.
                self.free_frame(frame);
            } else {
                self.retransmit_one(frame);
                count += 1;
            }
            if fbytes > 0 {
                self.cong.cwnd_update_after_timeout(fnum, transmit_ts, last);
                self.outq.window = self.cong.window();
            }
        }
        if count > 0 {
            warn!("level {}: {} frames marked lost", level, count);
        }
        self.update_loss_timer(level, now);
        count
    }

    /// Put one lost frame back on the right outbound queue, keeping
    /// (level, offset) order so retransmissions go out first and in
    /// sequence.
    fn retransmit_one(&mut self, frame: Frame) {
        let to_stream = frame.bytes > 0;
        if to_stream {
            if let Some(id) = frame.stream_id {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.send.frags = stream.send.frags.saturating_sub(1);
                    stream.send.bytes = stream.send.bytes.saturating_sub(u64::from(frame.bytes));
                }
            }
            // The bytes are counted again when the frame is resent.
            self.outq.bytes = self.outq.bytes.saturating_sub(u64::from(frame.bytes));
        }
        let list = if to_stream {
            &mut self.outq.stream_list
        } else {
            &mut self.outq.control_list
        };
        let mut at = list.len();
        for (j, pos) in list.iter().enumerate() {
            if frame.level.precedence() < pos.level.precedence() {
                continue;
            }
            if frame.level.precedence() > pos.level.precedence() {
                at = j;
                break;
            }
            if pos.offset == 0 || frame.offset < pos.offset {
                at = j;
                break;
            }
        }
        list.insert(at, frame);
    }

    /// Re-queue frames drained from an abandoned packet-number space
    /// (0-RTT rejection, key discard). The caller resets that space's
    /// pnmap; datagram frames are dropped rather than resent.
    pub fn retransmit_list(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            self.outq.data_inflight = self
                .outq
                .data_inflight
                .saturating_sub(u64::from(frame.bytes));
            if frame.kind.is_dgram() {
                self.free_frame(frame);
            } else {
                self.retransmit_one(frame);
            }
        }
    }

    /// Re-arm `level`'s loss timer from pnmap state: the recorded loss
    /// deadline if one exists, otherwise a PTO period after the last
    /// send, backed off by the retransmit count. Stops the timer when
    /// nothing is in flight.
    pub fn update_loss_timer(&mut self, level: Level, now: Instant) {
        let idx = level.index();
        let deadline = match self.pnmap[idx].loss_ts() {
            Some(deadline) => deadline,
            None => {
                if self.pnmap[idx].inflight() == 0 {
                    self.timers.stop(TimerKind::Loss(level));
                    return;
                }
                let period = self.cong.duration() * (1 + self.outq.rtx_count);
                match self.pnmap[idx].last_sent_ts() {
                    Some(sent) => sent + period,
                    None => now + period,
                }
            }
        };
        let deadline = deadline.max(now + Duration::from_micros(1));
        self.timers.reduce(TimerKind::Loss(level), deadline);
    }

    /// Loss-timer fire for `level`: retransmit what the filter allows,
    /// fall back to marking losses, and as a last resort elicit an ACK
    /// with a padded PING.
    pub fn transmit_one(&mut self, level: Level, now: Instant) {
        self.builder.set_filter(level, true);
        let mut sent = self.transmit(now);
        if !sent && self.retransmit_mark(level, false, now) > 0 {
            self.builder.set_filter(level, true);
            sent = self.transmit(now);
        }
        if !sent {
            let mut frame = Frame::ping(MIN_UDP_PAYLOAD);
            frame.level = level;
            debug!("level {}: probing with ping after loss timer", level);
            self.ctrl_tail(frame, false, now);
        }
        self.outq.rtx_count += 1;
        self.update_loss_timer(level, now);
    }

    // ---- path probing and migration --------------------------------

    /// Send a PMTU probe: a PING padded to the path's next probe size.
    pub fn transmit_probe(&mut self, now: Instant) {
        if self.state != ConnState::Established {
            return;
        }
        let probe_size = self.dst_path.pl().probe_size();
        let number = self.pnmap[Level::Application.index()].next_number();
        let taglen = self.builder.taglen();
        let frame = Frame::ping(probe_size);
        debug!("pmtu probe: size={} pn={}", probe_size, number);
        self.ctrl_tail(frame, false, now);
        let pathmtu = self.dst_path.pl_mut().send(number);
        if pathmtu > 0 {
            self.builder.mss_update(pathmtu + taglen);
        }
        self.timers.reset(TimerKind::Path, now + self.probe_timeout);
    }

    /// A path validation succeeded: migrate traffic onto it. `frame` is
    /// the triggering validation frame; its alternate-path bit is
    /// cleared along with every queued frame's.
    pub fn validate_path(&mut self, frame: &mut Frame, side: PathSide, now: Instant) {
        let local = match side {
            PathSide::Source => self.src_path.udp_bind(),
            PathSide::Destination => self.dst_path.udp_bind(),
        };
        if !self.events.deliver(Event::ConnectionMigration { local }) {
            return;
        }

        let mut path_alt = PATH_ALT_DST;
        {
            let path = match side {
                PathSide::Source => &mut self.src_path,
                PathSide::Destination => &mut self.dst_path,
            };
            if local {
                path.swap_active();
                path_alt = PATH_ALT_SRC;
            }
            path.free_alt();
            path.set_sent_cnt(0);
        }
        match side {
            PathSide::Source => self.local_addr = self.src_path.active(),
            PathSide::Destination => self.peer_addr = self.dst_path.active(),
        }
        self.timers.stop(TimerKind::Path);
        self.timers.reset(TimerKind::Path, now + self.probe_timeout);

        for pos in self.outq.control_list.iter_mut() {
            pos.path_alt &= !path_alt;
        }
        for pos in self.outq.transmitted_list.iter_mut() {
            pos.path_alt &= !path_alt;
        }
        frame.path_alt &= !path_alt;
        // ECN state is path-scoped: the new path revalidates from scratch.
        self.ecn_ect0 = false;
        self.builder.set_ecn_probes(0);
        info!("connection migrated, local={}", local);
    }

    // ---- close orchestration ---------------------------------------

    /// Close with a transport error: notify the application, cache the
    /// error for the frame builder, emit CONNECTION_CLOSE at `level` and
    /// mark the connection closed.
    pub fn transmit_close(&mut self, frame_type: FrameKind, errcode: u64, level: Level, now: Instant) {
        if errcode == 0 {
            return;
        }
        let event = Event::ConnectionClose {
            errcode,
            frame: frame_type,
            phrase: self.outq.close_phrase.clone(),
        };
        if !self.events.deliver(event) {
            return;
        }

        self.outq.close_errcode = errcode;
        self.outq.close_frame = frame_type;

        let mut frame =
            Frame::connection_close(FrameKind::ConnectionClose, level, self.outq.close_phrase());
        frame.level = level;
        self.ctrl_tail(frame, false, now);
        self.state = ConnState::Closed;
        info!("connection closed: errcode={} level={}", errcode, level);
    }

    /// Application-initiated close. Suppressed entirely once the
    /// connection is closed or idle; callers handle idle timeout and
    /// peer-initiated close without this frame.
    pub fn transmit_app_close(&mut self, now: Instant) {
        let errcode = transport_error::APPLICATION_ERROR;
        let (kind, level) = match self.state {
            ConnState::Established => (FrameKind::ConnectionCloseApp, Level::Application),
            ConnState::Establishing => {
                self.outq.close_errcode = errcode;
                (FrameKind::ConnectionClose, Level::Initial)
            }
            ConnState::Closed => return,
        };
        let mut frame = Frame::connection_close(kind, level, self.outq.close_phrase());
        frame.level = level;
        self.ctrl_tail(frame, false, now);
    }

    // ---- purge paths -----------------------------------------------

    /// Drop every frame belonging to `id` from the transmitted and
    /// stream queues, unwinding inflight accounting for tracked frames.
    pub fn stream_purge(&mut self, id: StreamId) {
        let mut i = 0;
        while i < self.outq.transmitted_list.len() {
            if self.outq.transmitted_list[i].stream_id != Some(id) {
                i += 1;
                continue;
            }
            let Some(frame) = self.outq.transmitted_list.remove(i) else {
                break;
            };
            self.pnmap[frame.level.index()].dec_inflight(frame.len);
            self.outq.data_inflight = self
                .outq
                .data_inflight
                .saturating_sub(u64::from(frame.bytes));
            self.outq.inflight = self.outq.inflight.saturating_sub(u64::from(frame.len));
            self.free_frame(frame);
        }
        let mut i = 0;
        while i < self.outq.stream_list.len() {
            if self.outq.stream_list[i].stream_id != Some(id) {
                i += 1;
                continue;
            }
            let Some(frame) = self.outq.stream_list.remove(i) else {
                break;
            };
            self.free_frame(frame);
        }
        debug!("stream {} purged", id);
    }

    /// Drop every frame in one queue, uncharging their bytes.
    pub fn list_purge(&mut self, queue: QueueKind) {
        let list = match queue {
            QueueKind::Stream => &mut self.outq.stream_list,
            QueueKind::Datagram => &mut self.outq.datagram_list,
            QueueKind::Control => &mut self.outq.control_list,
            QueueKind::Transmitted => &mut self.outq.transmitted_list,
        };
        let frames: Vec<Frame> = list.drain(..).collect();
        for frame in frames {
            self.free_frame(frame);
        }
    }

    /// Final teardown: purge everything still queued.
    pub fn teardown(&mut self) {
        self.list_purge(QueueKind::Transmitted);
        self.list_purge(QueueKind::Datagram);
        self.list_purge(QueueKind::Control);
        self.list_purge(QueueKind::Stream);
    }

    fn free_frame(&mut self, frame: Frame) {
        if self.wmem.uncharge(frame.bytes) {
            // Advisory wake; a full sink just drops it.
            self.events.deliver(Event::WriteSpace {
                wspace: self.wmem.wspace(),
            });
        }
    }

    // ---- configuration ---------------------------------------------

    /// Merge peer transport parameters: send limits, datagram sizing,
    /// idle-timeout reconciliation and 1-RTT tag elision.
    pub fn set_param(&mut self, p: &TransportParameters) {
        self.outq.max_datagram_frame_size = p.max_datagram_frame_size;
        self.outq.max_udp_payload_size = p.max_udp_payload_size;
        self.outq.ack_delay_exponent = p.ack_delay_exponent;
        self.outq.max_idle_timeout = p.max_idle_timeout;
        self.outq.max_ack_delay = p.max_ack_delay;
        self.outq.grease_quic_bit = p.grease_quic_bit;
        self.outq.disable_1rtt_encryption = p.disable_1rtt_encryption;
        self.cong.set_max_ack_delay(p.max_ack_delay);

        self.outq.max_bytes = p.max_data;
        self.wmem.set_sndbuf(2 * p.max_data);

        let remote_idle = p.max_idle_timeout;
        if !remote_idle.is_zero()
            && (self.local_max_idle_timeout.is_zero() || remote_idle < self.local_max_idle_timeout)
        {
            self.local_max_idle_timeout = remote_idle;
        }

        if self.local_disable_1rtt_encryption && p.disable_1rtt_encryption {
            self.builder.set_taglen(0);
        }
    }

    // ---- encrypted handoff (called under the connection lock) -------

    /// Route one externally encrypted packet toward the wire.
    pub fn xmit_encrypted(&mut self, packet: EncryptedPacket) {
        self.builder.config(packet.level, packet.path_alt);
        self.builder.xmit(packet);
    }

    /// Flush wire output queued by [`Self::xmit_encrypted`].
    pub fn flush_encrypted(&mut self) -> bool {
        self.builder.flush()
    }

    // ---- accessors --------------------------------------------------

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// Whether the connection is gone as far as deferred work is
    /// concerned.
    pub fn is_dead(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn outq(&self) -> &Outqueue {
        &self.outq
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamTable {
        &mut self.streams
    }

    pub fn cong(&self) -> &CongestionController {
        &self.cong
    }

    pub fn pnmap(&self, level: Level) -> &PacketNumberMap {
        &self.pnmap[level.index()]
    }

    pub fn pnmap_mut(&mut self, level: Level) -> &mut PacketNumberMap {
        &mut self.pnmap[level.index()]
    }

    pub fn crypto(&self, level: Level) -> &CryptoState {
        &self.crypto[level.index()]
    }

    pub fn crypto_mut(&mut self, level: Level) -> &mut CryptoState {
        &mut self.crypto[level.index()]
    }

    pub fn timers(&self) -> &TimerTable {
        &self.timers
    }

    pub fn wmem(&self) -> &WriteMemory {
        &self.wmem
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut B {
        &mut self.builder
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn src_path(&self) -> &Path {
        &self.src_path
    }

    pub fn src_path_mut(&mut self) -> &mut Path {
        &mut self.src_path
    }

    pub fn dst_path(&self) -> &Path {
        &self.dst_path
    }

    pub fn dst_path_mut(&mut self) -> &mut Path {
        &mut self.dst_path
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn ecn_ect0(&self) -> bool {
        self.ecn_ect0
    }

    /// Raise the connection send limit (peer MAX_DATA).
    pub fn set_max_data(&mut self, max_data: u64) {
        if max_data > self.outq.max_bytes {
            self.outq.max_bytes = max_data;
        }
    }

    /// Level at which fresh application data goes out (0-RTT vs 1-RTT).
    pub fn set_data_level(&mut self, level: Level) {
        self.outq.data_level = level;
    }

    /// Cache the application close error and phrase for the close frame.
    pub fn set_close_info(&mut self, errcode: u64, phrase: Option<String>) {
        self.outq.close_errcode = errcode;
        self.outq.close_phrase = phrase;
    }
}
