//! End-to-end tests for the egress core
//!
//! These drive the whole pipeline (enqueue, transmit pump, packet
//! assembly, acknowledgment, loss marking, probing, migration) through
//! the public API with the default assembler and event queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Mutex;

use quic_egress::*;

fn established(initial_max_data: u64) -> Egress {
    let config = EgressConfig {
        initial_max_data,
        ..EgressConfig::default()
    };
    let mut egress = Egress::new(config);
    egress.set_state(ConnState::Established);
    for level in Level::ALL {
        egress.crypto_mut(level).set_send_ready(true);
    }
    egress
}

fn stream_frame(id: u64, offset: u64, bytes: usize, fin: bool) -> Frame {
    Frame::stream(StreamId::new(id), offset, Bytes::from(vec![0u8; bytes]), fin)
}

mod transmit_pump {
    use super::*;

    #[test]
    fn test_corked_writes_coalesce_into_one_flush() {
        let mut egress = established(10_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 2_000);
        let now = Instant::now();

        egress.stream_tail(stream_frame(4, 0, 400, false), true, now);
        egress.stream_tail(stream_frame(4, 400, 400, false), true, now);
        egress.stream_tail(stream_frame(4, 800, 400, false), false, now);

        assert_eq!(egress.outq().data_inflight(), 1200);
        let stream = egress.streams().get(id).unwrap();
        assert_eq!(stream.send.bytes, 1200);
        assert_eq!(stream.send.frags, 3);
        assert_eq!(egress.outq().transmitted().count(), 3);
        assert!(egress.outq().transmitted().all(|f| f.number > 0));
        assert_eq!(egress.outq().stream_queue().count(), 0);
        assert!(egress.timers().is_armed(TimerKind::Loss(Level::Application)));
    }

    #[test]
    fn test_control_pass_stops_at_unready_level() {
        let mut egress = established(10_000);
        egress.crypto_mut(Level::Handshake).set_send_ready(false);
        let now = Instant::now();

        let crypto = Frame::crypto(Level::Handshake, 0, Bytes::from_static(b"finished"));
        egress.ctrl_tail(crypto, true, now);
        egress.ctrl_tail(Frame::ping(1), false, now);

        // The handshake frame heads the queue and its keys are missing,
        // so the whole pass stalls behind it.
        assert_eq!(egress.outq().transmitted().count(), 0);
        assert_eq!(egress.outq().control_queue().count(), 2);

        egress.crypto_mut(Level::Handshake).set_send_ready(true);
        egress.transmit(now);
        assert_eq!(egress.outq().transmitted().count(), 2);
        assert_eq!(egress.outq().control_queue().count(), 0);
    }

    #[test]
    fn test_transmitted_list_keeps_handshake_first() {
        let mut egress = established(10_000);
        let now = Instant::now();
        egress.ctrl_tail(Frame::ping(1), false, now);
        let crypto = Frame::crypto(Level::Handshake, 0, Bytes::from_static(b"hs"));
        egress.ctrl_tail(crypto, false, now);

        let levels: Vec<Level> = egress.outq().transmitted().map(|f| f.level).collect();
        assert_eq!(levels, vec![Level::Handshake, Level::Application]);
    }

    #[test]
    fn test_datagram_pass_respects_congestion_window() {
        let mut egress = established(1_000_000);
        let now = Instant::now();
        // Window starts at 10 * mss = 12000; each datagram carries 2000.
        for _ in 0..7 {
            egress.dgram_tail(Frame::datagram(Bytes::from(vec![0u8; 2000])), true, now);
        }
        egress.transmit(now);

        assert_eq!(egress.outq().data_inflight(), 12_000);
        assert_eq!(egress.outq().datagram_queue().count(), 1);
        assert_eq!(egress.outq().transmitted().count(), 6);
    }
}

mod flow_control {
    use super::*;

    #[test]
    fn test_connection_stall_emits_data_blocked_once_per_epoch() {
        let mut egress = established(1_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 10_000);
        let now = Instant::now();

        egress.stream_tail(stream_frame(4, 0, 800, false), false, now);
        assert_eq!(egress.outq().bytes(), 800);

        // 300 more exceed the 1000-byte connection limit.
        egress.stream_tail(stream_frame(4, 800, 300, false), false, now);
        assert_eq!(egress.outq().stream_queue().count(), 1);
        assert!(egress.outq().data_blocked());
        assert_eq!(egress.outq().data_inflight(), 800);
        // The DATA_BLOCKED signal shipped in the same flush cycle.
        let blocked: Vec<&Frame> = egress
            .outq()
            .transmitted()
            .filter(|f| f.kind == FrameKind::DataBlocked)
            .collect();
        assert_eq!(blocked.len(), 1);
        let blocked_pn = blocked[0].number;

        // A stalled retry does not signal again within the same epoch.
        egress.transmit(now);
        let count = egress
            .outq()
            .transmitted()
            .filter(|f| f.kind == FrameKind::DataBlocked)
            .count();
        assert_eq!(count, 1);

        // Peer acks the signal and raises the limit; data flows, and the
        // next stall in the new epoch may signal again.
        egress.transmitted_sack(Level::Application, blocked_pn, blocked_pn, blocked_pn, Duration::ZERO, now);
        assert!(!egress.outq().data_blocked());
        egress.set_max_data(1_100);
        egress.transmit(now);
        assert_eq!(egress.outq().stream_queue().count(), 0);
        assert_eq!(egress.outq().bytes(), 1_100);

        egress.stream_tail(stream_frame(4, 1_100, 100, false), false, now);
        assert!(egress.outq().data_blocked());
        let resignaled = egress
            .outq()
            .control_queue()
            .chain(egress.outq().transmitted())
            .filter(|f| f.kind == FrameKind::DataBlocked)
            .count();
        assert_eq!(resignaled, 1);
    }

    #[test]
    fn test_stream_stall_emits_stream_data_blocked() {
        let mut egress = established(100_000);
        let id = StreamId::new(8);
        egress.streams_mut().open(id, 500);
        let now = Instant::now();

        egress.stream_tail(stream_frame(8, 0, 800, false), false, now);

        assert_eq!(egress.outq().stream_queue().count(), 1);
        let stream = egress.streams().get(id).unwrap();
        assert!(stream.send.data_blocked);
        assert_eq!(stream.send.last_max_bytes, 500);
        assert!(egress
            .outq()
            .transmitted()
            .any(|f| f.kind == FrameKind::StreamDataBlocked && f.stream_id == Some(id)));
    }

    #[test]
    fn test_pure_congestion_stall_is_silent() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let now = Instant::now();

        // Fill the 12000-byte window, then stall on congestion alone.
        for k in 0..6 {
            egress.stream_tail(stream_frame(4, k * 2_000, 2_000, false), false, now);
        }
        egress.stream_tail(stream_frame(4, 12_000, 2_000, false), false, now);

        assert_eq!(egress.outq().stream_queue().count(), 1);
        assert!(!egress.outq().data_blocked());
        assert!(egress.outq().transmitted().all(|f| f.kind != FrameKind::DataBlocked));
    }
}

mod acknowledgment {
    use super::*;

    #[test]
    fn test_sack_retires_range_and_samples_rtt_once() {
        let mut egress = established(100_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 10_000);
        let t0 = Instant::now();

        egress.stream_tail(stream_frame(4, 0, 100, false), false, t0);
        egress.stream_tail(stream_frame(4, 100, 100, false), false, t0 + Duration::from_millis(10));
        egress.stream_tail(stream_frame(4, 200, 100, false), false, t0 + Duration::from_millis(20));
        assert_eq!(egress.outq().data_inflight(), 300);

        let now = t0 + Duration::from_millis(50);
        let acked = egress.transmitted_sack(Level::Application, 1, 3, 3, Duration::from_millis(5), now);

        assert_eq!(acked, 300);
        assert_eq!(egress.outq().data_inflight(), 0);
        assert_eq!(egress.outq().inflight(), 0);
        assert_eq!(egress.outq().transmitted().count(), 0);
        assert_eq!(egress.outq().rtx_count(), 0);
        // One sample, from packet 3: 50ms - 20ms = 30ms.
        assert_eq!(egress.cong().rtt_stats().latest_rtt, Some(Duration::from_millis(30)));
        assert_eq!(egress.pnmap(Level::Application).max_pn_acked(), 3);
        // Everything retired: the loss timer stands down.
        assert!(!egress.timers().is_armed(TimerKind::Loss(Level::Application)));

        // Replaying the same range changes nothing.
        let again = egress.transmitted_sack(Level::Application, 1, 3, 3, Duration::from_millis(5), now);
        assert_eq!(again, 0);
        assert_eq!(egress.cong().rtt_stats().latest_rtt, Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_sack_ignores_other_levels() {
        let mut egress = established(100_000);
        let now = Instant::now();
        let crypto = Frame::crypto(Level::Handshake, 0, Bytes::from_static(b"hs"));
        egress.ctrl_tail(crypto, false, now);
        assert_eq!(egress.outq().transmitted().count(), 1);

        egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, now);
        assert_eq!(egress.outq().transmitted().count(), 1);

        egress.transmitted_sack(Level::Handshake, 1, 1, 1, Duration::ZERO, now);
        assert_eq!(egress.outq().transmitted().count(), 0);
    }

    #[test]
    fn test_partial_range_stops_at_smallest() {
        let mut egress = established(100_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 100_000);
        let now = Instant::now();
        for k in 0..5 {
            egress.stream_tail(stream_frame(4, k * 100, 100, false), false, now);
        }

        let acked = egress.transmitted_sack(Level::Application, 3, 5, 5, Duration::ZERO, now);
        assert_eq!(acked, 300);
        assert_eq!(egress.outq().data_inflight(), 200);
        let left: Vec<u64> = egress.outq().transmitted().map(|f| f.number).collect();
        assert_eq!(left, vec![1, 2]);
    }
}

mod loss_recovery {
    use super::*;

    #[test]
    fn test_loss_marking_respects_reordering_and_time() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();
        // Ten frames, one packet each, numbers 1..=10.
        for k in 0..10u64 {
            egress.stream_tail(stream_frame(4, (k + 1) * 100, 50, false), false, t0);
        }
        assert_eq!(egress.outq().transmitted().count(), 10);

        // Peer has acked up to 16; within the RTO window only packets
        // more than the reorder threshold behind are lost.
        egress.pnmap_mut(Level::Application).set_max_pn_acked(16);
        let now = t0 + Duration::from_millis(10);
        let count = egress.retransmit_mark(Level::Application, false, now);

        // Every number n satisfies n + 6 <= 16, so the whole window is
        // reorder-lost despite being inside the RTO.
        assert_eq!(count, 10);
        assert_eq!(egress.outq().transmitted().count(), 0);
        let offsets: Vec<u64> = egress.outq().stream_queue().map(|f| f.offset).collect();
        assert_eq!(offsets, (1..=10u64).map(|k| k * 100).collect::<Vec<u64>>());
    }

    #[test]
    fn test_loss_ts_recorded_for_first_retained_frame() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();
        for k in 0..10u64 {
            egress.stream_tail(stream_frame(4, (k + 1) * 100, 50, false), false, t0);
        }

        egress.pnmap_mut(Level::Application).set_max_pn_acked(12);
        let now = t0 + Duration::from_millis(10);
        let count = egress.retransmit_mark(Level::Application, false, now);

        // Numbers 1..=6 fail the reorder check (n + 6 <= 12); number 7
        // passes it inside the RTO window, so the scan stops there.
        assert_eq!(count, 6);
        assert_eq!(egress.outq().transmitted().count(), 4);
        let offsets: Vec<u64> = egress.outq().stream_queue().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![100, 200, 300, 400, 500, 600]);

        let rto = egress.cong().rto();
        assert_eq!(egress.pnmap(Level::Application).loss_ts(), Some(t0 + rto));
        assert_eq!(
            egress.timers().expires_at(TimerKind::Loss(Level::Application)),
            Some(t0 + rto)
        );
        // The halved window is mirrored into the outqueue.
        assert_eq!(egress.outq().window(), egress.cong().window());
    }

    #[test]
    fn test_marked_frames_retransmit_with_fresh_numbers() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();
        egress.stream_tail(stream_frame(4, 100, 50, false), false, t0);
        assert_eq!(egress.outq().transmitted().next().unwrap().number, 1);

        let count = egress.retransmit_mark(Level::Application, true, t0);
        assert_eq!(count, 1);
        assert_eq!(egress.outq().data_inflight(), 0);

        egress.transmit(t0 + Duration::from_millis(1));
        let frame = egress.outq().transmitted().next().unwrap();
        assert_eq!(frame.number, 2);
        assert_eq!(egress.outq().data_inflight(), 50);
        assert_eq!(egress.streams().get(id).unwrap().send.frags, 1);
    }

    #[test]
    fn test_expired_datagrams_are_dropped_not_retransmitted() {
        let mut egress = established(1_000_000);
        let now = Instant::now();
        egress.dgram_tail(Frame::datagram(Bytes::from(vec![0u8; 500])), false, now);
        assert_eq!(egress.wmem().alloc(), 500);

        let count = egress.retransmit_mark(Level::Application, true, now);
        assert_eq!(count, 0);
        assert_eq!(egress.outq().transmitted().count(), 0);
        assert_eq!(egress.outq().datagram_queue().count(), 0);
        assert_eq!(egress.wmem().alloc(), 0);
    }

    #[test]
    fn test_loss_timer_fire_on_empty_queues_sends_ping() {
        let mut egress = established(100_000);
        let now = Instant::now();

        egress.transmit_one(Level::Application, now);

        assert_eq!(egress.outq().rtx_count(), 1);
        assert!(egress
            .outq()
            .transmitted()
            .any(|f| f.kind == FrameKind::Ping && f.len == 1200));
        assert!(egress.timers().is_armed(TimerKind::Loss(Level::Application)));
    }

    #[test]
    fn test_loss_timer_fire_retransmits_marked_frames_first() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();
        egress.stream_tail(stream_frame(4, 0, 200, false), false, t0);

        // Fire well past the RTO: the frame is marked lost and resent in
        // the same call, no PING needed.
        let now = t0 + Duration::from_secs(2);
        egress.transmit_one(Level::Application, now);

        assert_eq!(egress.outq().rtx_count(), 1);
        assert_eq!(egress.outq().transmitted().count(), 1);
        assert!(egress.outq().transmitted().all(|f| f.kind == FrameKind::Stream));
        assert_eq!(egress.outq().data_inflight(), 200);
    }
}

mod uplink {
    use super::*;

    #[test]
    fn test_refused_stream_event_leaves_frame_linked() {
        let config = EgressConfig::default();
        let mut egress: Egress<PacketAssembler, EventQueue> =
            Egress::with_parts(config, PacketAssembler::new(1200), EventQueue::new(1));
        egress.set_state(ConnState::Established);
        for level in Level::ALL {
            egress.crypto_mut(level).set_send_ready(true);
        }
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 10_000);
        let now = Instant::now();

        egress.stream_tail(stream_frame(4, 0, 300, true), false, now);
        assert_eq!(egress.streams().get(id).unwrap().send.state, SendState::Sent);

        // Occupy the sink so the final-ack notification is refused.
        egress
            .events_mut()
            .deliver(Event::ConnectionMigration { local: false });

        let acked = egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, now);
        assert_eq!(acked, 0);
        assert_eq!(egress.outq().transmitted().count(), 1);
        assert_eq!(egress.outq().data_inflight(), 300);
        let stream = egress.streams().get(id).unwrap();
        assert_eq!(stream.send.frags, 1);
        assert_eq!(stream.send.state, SendState::Sent);

        // Application drains an event; the retried ack goes through.
        egress.events_mut().pop();
        let acked = egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, now);
        assert_eq!(acked, 300);
        assert_eq!(egress.outq().transmitted().count(), 0);
        let stream = egress.streams().get(id).unwrap();
        assert_eq!(stream.send.frags, 0);
        assert_eq!(stream.send.state, SendState::Recvd);
        assert_eq!(
            egress.events_mut().pop(),
            Some(Event::StreamUpdate {
                id,
                state: SendState::Recvd,
                errcode: 0
            })
        );
    }

    #[test]
    fn test_full_send_buffer_drain_wakes_writers() {
        let config = EgressConfig {
            sndbuf: 300,
            ..EgressConfig::default()
        };
        let mut egress = Egress::new(config);
        egress.set_state(ConnState::Established);
        for level in Level::ALL {
            egress.crypto_mut(level).set_send_ready(true);
        }
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 10_000);
        let now = Instant::now();

        egress.stream_tail(stream_frame(4, 0, 300, false), false, now);
        assert!(!egress.wmem().writable());

        // Retiring the frame drains the full buffer and signals the wake.
        egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, now);
        assert!(egress.wmem().writable());
        assert_eq!(
            egress.events_mut().pop(),
            Some(Event::WriteSpace { wspace: 300 })
        );

        // Purging frames from a full buffer signals it too.
        egress.stream_tail(stream_frame(4, 300, 300, false), false, now);
        assert!(!egress.wmem().writable());
        egress.stream_purge(id);
        assert_eq!(
            egress.events_mut().pop(),
            Some(Event::WriteSpace { wspace: 300 })
        );
    }

    #[test]
    fn test_partial_drain_of_writable_buffer_stays_quiet() {
        let mut egress = established(100_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 10_000);
        let now = Instant::now();

        egress.stream_tail(stream_frame(4, 0, 300, false), false, now);
        assert!(egress.wmem().writable());
        egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, now);
        assert_eq!(egress.events_mut().pop(), None);
    }
}

mod path {
    use super::*;

    #[test]
    fn test_pmtu_probe_and_confirmation_raise_mss() {
        let mut egress = established(100_000);
        let now = Instant::now();
        let probe_size = egress.dst_path().pl().probe_size();

        egress.transmit_probe(now);
        assert!(egress
            .outq()
            .transmitted()
            .any(|f| f.kind == FrameKind::Ping && f.len == probe_size));
        assert!(egress.timers().is_armed(TimerKind::Path));
        let probe_pn = egress.outq().transmitted().next().unwrap().number;

        // Acking the probe validates the size and re-probes upward.
        egress.transmitted_sack(Level::Application, probe_pn, probe_pn, probe_pn, Duration::ZERO, now);
        let taglen = 16;
        assert_eq!(egress.builder().mss(), probe_size + taglen);
        assert!(egress
            .outq()
            .transmitted()
            .any(|f| f.kind == FrameKind::Ping && f.len == probe_size + 32));
    }

    #[test]
    fn test_migration_clears_alternate_path_bits() {
        let mut egress = established(100_000);
        let now = Instant::now();
        egress.src_path_mut().set_alternate("192.0.2.7:4433".parse().unwrap());

        let mut sent = stream_frame(4, 0, 100, false);
        sent.path_alt = PATH_ALT_SRC;
        egress.streams_mut().open(StreamId::new(4), 1_000);
        egress.stream_tail(sent, false, now);
        assert!(egress.outq().transmitted().any(|f| f.path_alt & PATH_ALT_SRC != 0));

        let mut marked = Frame::ping(1);
        marked.path_alt = PATH_ALT_SRC;
        egress.ctrl_tail(marked.clone(), true, now);
        egress.ctrl_tail(marked, true, now);
        assert_eq!(egress.outq().control_queue().count(), 2);

        let mut trigger = Frame::ping(1);
        trigger.path_alt = PATH_ALT_SRC | PATH_ALT_DST;
        egress.validate_path(&mut trigger, PathSide::Source, now);

        assert_eq!(egress.src_path().active(), Some("192.0.2.7:4433".parse().unwrap()));
        assert_eq!(egress.src_path().alternate(), None);
        assert_eq!(egress.local_addr(), Some("192.0.2.7:4433".parse().unwrap()));
        assert!(egress.outq().control_queue().all(|f| f.path_alt & PATH_ALT_SRC == 0));
        assert!(egress.outq().transmitted().all(|f| f.path_alt & PATH_ALT_SRC == 0));
        assert_eq!(trigger.path_alt, PATH_ALT_DST);
        assert!(egress.timers().is_armed(TimerKind::Path));
        assert_eq!(
            egress.events_mut().pop(),
            Some(Event::ConnectionMigration { local: true })
        );
    }

    #[test]
    fn test_migration_resets_ecn_state() {
        let mut egress = established(100_000);
        let now = Instant::now();
        egress.src_path_mut().set_alternate("192.0.2.7:4433".parse().unwrap());

        // An acknowledged ECN-marked packet enables ECT(0) on this path.
        egress.builder_mut().set_ecn_probes(1);
        egress.ctrl_tail(Frame::ping(1), false, now);
        egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, now);
        assert!(egress.ecn_ect0());

        let mut trigger = Frame::ping(1);
        trigger.path_alt = PATH_ALT_SRC;
        egress.validate_path(&mut trigger, PathSide::Source, now);
        assert!(!egress.ecn_ect0());
    }

    #[test]
    fn test_vetoed_migration_changes_nothing() {
        let config = EgressConfig::default();
        let mut egress: Egress<PacketAssembler, EventQueue> =
            Egress::with_parts(config, PacketAssembler::new(1200), EventQueue::new(0));
        egress.set_state(ConnState::Established);
        egress.src_path_mut().set_alternate("192.0.2.7:4433".parse().unwrap());
        let now = Instant::now();

        let mut trigger = Frame::ping(1);
        trigger.path_alt = PATH_ALT_SRC;
        egress.validate_path(&mut trigger, PathSide::Source, now);

        assert_eq!(egress.src_path().alternate(), Some("192.0.2.7:4433".parse().unwrap()));
        assert_eq!(trigger.path_alt, PATH_ALT_SRC);
        assert!(!egress.timers().is_armed(TimerKind::Path));
    }
}

mod close {
    use super::*;

    #[test]
    fn test_transmit_close_notifies_and_ships_frame() {
        let mut egress = established(100_000);
        let now = Instant::now();

        egress.transmit_close(FrameKind::Stream, 7, Level::Application, now);

        assert_eq!(egress.state(), ConnState::Closed);
        assert_eq!(egress.outq().close_errcode(), 7);
        assert_eq!(egress.outq().close_frame(), FrameKind::Stream);
        assert!(egress
            .outq()
            .transmitted()
            .any(|f| f.kind == FrameKind::ConnectionClose));
        assert_eq!(
            egress.events_mut().pop(),
            Some(Event::ConnectionClose {
                errcode: 7,
                frame: FrameKind::Stream,
                phrase: None
            })
        );
    }

    #[test]
    fn test_close_with_zero_errcode_is_noop() {
        let mut egress = established(100_000);
        let now = Instant::now();
        egress.transmit_close(FrameKind::Stream, 0, Level::Application, now);
        assert_eq!(egress.state(), ConnState::Established);
        assert_eq!(egress.outq().transmitted().count(), 0);
    }

    #[test]
    fn test_app_close_during_handshake_uses_initial_level() {
        let mut egress = established(100_000);
        egress.set_state(ConnState::Establishing);
        let now = Instant::now();

        egress.transmit_app_close(now);

        let frame = egress.outq().transmitted().next().unwrap();
        assert_eq!(frame.kind, FrameKind::ConnectionClose);
        assert_eq!(frame.level, Level::Initial);
        assert_eq!(
            egress.outq().close_errcode(),
            quic_egress::error::transport_error::APPLICATION_ERROR
        );
    }

    #[test]
    fn test_app_close_when_established_uses_app_frame() {
        let mut egress = established(100_000);
        let now = Instant::now();
        egress.transmit_app_close(now);
        let frame = egress.outq().transmitted().next().unwrap();
        assert_eq!(frame.kind, FrameKind::ConnectionCloseApp);
        assert_eq!(frame.level, Level::Application);
    }

    #[test]
    fn test_app_close_after_close_is_suppressed() {
        let mut egress = established(100_000);
        egress.set_state(ConnState::Closed);
        let now = Instant::now();
        egress.transmit_app_close(now);
        assert_eq!(egress.outq().transmitted().count(), 0);
    }
}

mod invariants {
    use super::*;

    #[test]
    fn test_data_inflight_matches_transmitted_sum() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();

        for k in 0..5u64 {
            egress.stream_tail(stream_frame(4, (k + 1) * 300, 300, false), false, t0);
        }
        egress.dgram_tail(Frame::datagram(Bytes::from(vec![0u8; 200])), false, t0);
        egress.transmitted_sack(Level::Application, 2, 3, 3, Duration::ZERO, t0);
        egress.retransmit_mark(Level::Application, true, t0);
        // Resend what the loss scan put back.
        egress.transmit(t0);

        let sum: u64 = egress.outq().transmitted().map(|f| u64::from(f.bytes)).sum();
        assert_eq!(sum, egress.outq().data_inflight());
        let wire: u64 = egress.outq().transmitted().map(|f| u64::from(f.len)).sum();
        assert_eq!(wire, egress.outq().inflight());
    }

    #[test]
    fn test_frags_match_queued_and_tracked_frames() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();

        for k in 0..4u64 {
            egress.stream_tail(stream_frame(4, (k + 1) * 100, 100, false), false, t0);
        }
        egress.retransmit_mark(Level::Application, true, t0);
        egress.stream_tail(stream_frame(4, 900, 100, false), true, t0);
        egress.transmit(t0);

        // frags counts only frames the packet builder has accepted.
        let tracked = egress.outq().transmitted().count() as u32;
        assert_eq!(egress.streams().get(id).unwrap().send.frags, tracked);
    }

    #[test]
    fn test_loss_timer_armed_iff_inflight() {
        let mut egress = established(1_000_000);
        let id = StreamId::new(4);
        egress.streams_mut().open(id, 1_000_000);
        let t0 = Instant::now();

        assert!(!egress.timers().is_armed(TimerKind::Loss(Level::Application)));
        egress.stream_tail(stream_frame(4, 0, 100, false), false, t0);
        assert!(egress.timers().is_armed(TimerKind::Loss(Level::Application)));
        egress.transmitted_sack(Level::Application, 1, 1, 1, Duration::ZERO, t0);
        assert!(!egress.timers().is_armed(TimerKind::Loss(Level::Application)));
    }
}

mod crypto_tail {
    use super::*;

    fn encrypted(payload: &'static [u8]) -> EncryptedPacket {
        EncryptedPacket {
            level: Level::Application,
            path_alt: 0,
            data: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_encrypted_packets_drain_to_wire() {
        let egress = Arc::new(Mutex::new(established(100_000)));
        let tail = spawn_crypto_tail(egress.clone());

        tail.encrypted_tail(encrypted(b"one")).unwrap();
        tail.encrypted_tail(encrypted(b"two")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let egress = egress.lock().await;
        assert_eq!(egress.builder().wire().len(), 2);
    }

    #[tokio::test]
    async fn test_dead_connection_purges_write_queue() {
        let mut dead = established(100_000);
        dead.set_state(ConnState::Closed);
        let egress = Arc::new(Mutex::new(dead));
        let tail = spawn_crypto_tail(egress.clone());

        tail.encrypted_tail(encrypted(b"late")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let egress = egress.lock().await;
            assert_eq!(egress.builder().wire().len(), 0);
        }
        // The worker exited with the connection; the handle reports it.
        assert!(tail.encrypted_tail(encrypted(b"more")).is_err());
    }
}
