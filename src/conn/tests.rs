use super::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::{Arc, Mutex};

const CONV: u32 = 123;

type Outbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

fn conn(conv: u32) -> (Connection, Outbox) {
    let outbox: Outbox = Default::default();
    let sink = outbox.clone();
    let conn = Connection::new(conv, move |bytes: &[u8]| {
        sink.lock().unwrap().push_back(bytes.to_vec())
    });
    (conn, outbox)
}

fn pair() -> (Connection, Outbox, Connection, Outbox) {
    let (a, a_out) = conn(CONV);
    let (b, b_out) = conn(CONV);
    (a, a_out, b, b_out)
}

fn drain(outbox: &Outbox) -> Vec<Vec<u8>> {
    outbox.lock().unwrap().drain(..).collect()
}

/// One tick of a lossless loopback: update both peers, then deliver
/// everything each peer emitted to the other.
fn tick(now: u32, a: &mut Connection, a_out: &Outbox, b: &mut Connection, b_out: &Outbox) {
    a.update(now);
    b.update(now);
    for datagram in drain(a_out) {
        b.input(&datagram).unwrap();
    }
    for datagram in drain(b_out) {
        a.input(&datagram).unwrap();
    }
}

/// The command bytes of every segment packed into a datagram.
fn commands(datagram: &[u8]) -> Vec<u8> {
    let mut cmds = Vec::new();
    let mut rest = datagram;
    while rest.len() >= OVERHEAD {
        let header = Header::decode(rest).unwrap();
        cmds.push(header.cmd);
        rest = &rest[OVERHEAD + header.len as usize..];
    }
    cmds
}

fn ack_bytes(sn: u32, ts: u32, wnd: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    Header {
        conv: CONV,
        cmd: Command::Ack.into(),
        frg: 0,
        wnd,
        ts,
        sn,
        una: 0,
        len: 0,
    }
    .encode_into(&mut buf);
    buf
}

fn push_bytes(sn: u32, frg: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    Header {
        conv: CONV,
        cmd: Command::Push.into(),
        frg,
        wnd: WND_RCV,
        ts: 0,
        sn,
        una: 0,
        len: data.len() as u32,
    }
    .encode_into(&mut buf);
    buf.extend_from_slice(data);
    buf
}

#[test]
fn hello_round_trip() {
    let (mut a, a_out, mut b, b_out) = pair();
    a.send(Payload::new("hello")).unwrap();

    let mut received = None;
    for now in (0..=1000).step_by(100) {
        tick(now, &mut a, &a_out, &mut b, &b_out);
        if let Some(message) = b.recv() {
            received = Some(message);
        }
    }

    assert_eq!(received.unwrap().to_vec(), b"hello");
    assert_eq!(a.waitsnd(), 0);
}

#[test]
fn idle_connections_stay_quiet() {
    let (mut a, a_out, mut b, b_out) = pair();
    for now in (0..=1000).step_by(100) {
        a.update(now);
        b.update(now);
    }
    assert!(drain(&a_out).is_empty());
    assert!(drain(&b_out).is_empty());
}

#[test]
fn large_message_fragments_and_reassembles() {
    let expected: Vec<u8> = (0..10_240).map(|i| i as u8).collect();
    let (mut a, a_out, mut b, b_out) = pair();
    a.send(expected.clone()).unwrap();
    // ceil(10240 / 1376) fragments at the default MTU
    assert_eq!(a.waitsnd(), 8);

    let mut received = None;
    for now in (0..=3000).step_by(100) {
        tick(now, &mut a, &a_out, &mut b, &b_out);
        if let Some(message) = b.recv() {
            assert!(received.is_none(), "message delivered twice");
            received = Some(message);
        }
    }

    // Reassembly is all-or-nothing: the one successful recv is the whole
    // message.
    assert_eq!(received.unwrap().to_vec(), expected);
    assert_eq!(a.waitsnd(), 0);
}

#[test]
fn message_too_large_for_receive_window() {
    let (mut a, _a_out) = conn(CONV);
    a.set_mtu(74).unwrap(); // mss of 50 bytes
    assert_eq!(
        a.send(vec![0u8; 50 * 128]),
        Err(SendError::MessageTooLarge(128))
    );
    assert_eq!(a.waitsnd(), 0);
    // One fragment fewer fits
    a.send(vec![0u8; 50 * 127]).unwrap();
    assert_eq!(a.waitsnd(), 127);
}

#[test]
fn stream_mode_coalesces_submissions() {
    let outbox: Outbox = Default::default();
    let sink = outbox.clone();
    let mut a = Connection::new_stream(CONV, move |bytes: &[u8]| {
        sink.lock().unwrap().push_back(bytes.to_vec())
    });
    let (mut b, b_out) = conn(CONV);

    a.send(Payload::new("hel")).unwrap();
    a.send(Payload::new("lo")).unwrap();
    assert_eq!(a.waitsnd(), 1);

    // An empty submission is a no-op
    a.send(Payload::default()).unwrap();
    assert_eq!(a.waitsnd(), 1);

    let mut received = None;
    for now in (0..=500).step_by(100) {
        tick(now, &mut a, &outbox, &mut b, &b_out);
        if let Some(message) = b.recv() {
            received = Some(message);
        }
    }
    assert_eq!(received.unwrap().to_vec(), b"hello");
}

#[test]
fn out_of_order_datagrams_reassemble_in_order() {
    let (mut a, a_out, mut b, b_out) = pair();
    // Full-sized segments so each one occupies its own datagram, and no
    // congestion window in the way
    a.set_mtu(100).unwrap();
    a.set_nodelay(false, 100, 0, true);
    for fill in 1..=3u8 {
        a.send(vec![fill; 76]).unwrap();
    }

    a.update(0);
    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 3);
    for datagram in datagrams.iter().rev() {
        b.input(datagram).unwrap();
    }

    assert_eq!(b.recv().unwrap().to_vec(), vec![1u8; 76]);
    assert_eq!(b.recv().unwrap().to_vec(), vec![2u8; 76]);
    assert_eq!(b.recv().unwrap().to_vec(), vec![3u8; 76]);
    assert_eq!(b.recv(), None);
    let _ = drain(&b_out);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let (mut a, a_out, mut b, _b_out) = pair();
    a.set_nodelay(false, 100, 0, true);
    a.send(Payload::new("once")).unwrap();
    a.update(0);

    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 1);
    b.input(&datagrams[0]).unwrap();
    b.input(&datagrams[0]).unwrap();
    assert_eq!(b.recv().unwrap().to_vec(), b"once");
    assert_eq!(b.recv(), None);

    // A stale replay after delivery is dropped as well
    b.input(&datagrams[0]).unwrap();
    assert_eq!(b.recv(), None);
}

#[test]
fn partial_fragments_never_surface() {
    let (mut a, a_out, mut b, _b_out) = pair();
    a.set_mtu(100).unwrap(); // mss of 76: three fragments below
    a.set_nodelay(false, 100, 0, true);
    a.send(vec![9u8; 200]).unwrap();
    a.update(0);

    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 3);
    b.input(&datagrams[0]).unwrap();
    assert_eq!(b.peeksize(), None);
    assert_eq!(b.recv(), None);
    b.input(&datagrams[1]).unwrap();
    assert_eq!(b.recv(), None);
    b.input(&datagrams[2]).unwrap();
    assert_eq!(b.peeksize(), Some(200));
    assert_eq!(b.recv().unwrap().to_vec(), vec![9u8; 200]);
}

#[test]
fn recovers_from_sustained_loss() {
    let expected: Vec<u8> = (0..30_000).map(|i| (i * 7) as u8).collect();
    let (mut a, a_out, mut b, b_out) = pair();
    a.send(expected.clone()).unwrap();

    let mut received = None;
    let mut drop_counter = 0;
    let mut saw_collapse = false;
    let mut now = 0;
    while now <= 60_000 {
        a.update(now);
        b.update(now);
        // Observe the window right after the flush, before this tick's acks
        // can reopen it
        if a.cwnd == 1 && now >= 200 {
            saw_collapse = true;
        }
        for datagram in drain(&a_out) {
            // Drop every other outgoing datagram for the first two seconds
            drop_counter += 1;
            if now < 2000 && drop_counter % 2 == 0 {
                continue;
            }
            b.input(&datagram).unwrap();
        }
        for datagram in drain(&b_out) {
            a.input(&datagram).unwrap();
        }
        if let Some(message) = b.recv() {
            received = Some(message);
        }
        if received.is_some() && a.waitsnd() == 0 {
            break;
        }
        now += 100;
    }

    assert_eq!(received.unwrap().to_vec(), expected);
    assert_eq!(a.waitsnd(), 0);
    assert!(saw_collapse, "congestion window never collapsed under loss");
    assert!(a.cwnd > 1, "congestion window never regrew");
}

#[test]
fn sequence_numbers_wrap_around() {
    let (mut a, a_out, mut b, b_out) = pair();
    let start = u32::MAX - 3;
    a.snd_una = start;
    a.snd_nxt = start;
    b.rcv_nxt = start;

    let expected: Vec<u8> = (0..10_240).map(|i| (i * 3) as u8).collect();
    a.send(expected.clone()).unwrap();

    let mut received = None;
    for now in (0..=3000).step_by(100) {
        tick(now, &mut a, &a_out, &mut b, &b_out);
        if let Some(message) = b.recv() {
            received = Some(message);
        }
    }

    assert_eq!(received.unwrap().to_vec(), expected);
    assert_eq!(a.waitsnd(), 0);
    assert!(diff(a.snd_nxt, start) > 0);
    assert!(a.snd_nxt < 100, "send counter should have wrapped");
}

#[test]
fn zero_window_stalls_and_probes() {
    let (mut a, a_out, mut b, b_out) = pair();
    // Keep the sender limited by the remote window alone so the receive
    // queue saturates quickly
    a.set_nodelay(false, 100, 0, true);
    for _ in 0..200 {
        a.send(Payload::new("x")).unwrap();
    }

    // B buffers but its application never drains, so its advertised window
    // eventually collapses to zero and A stalls.
    let mut saw_probe = false;
    let mut now = 0;
    while now <= 12_000 {
        a.update(now);
        b.update(now);
        for datagram in drain(&a_out) {
            if commands(&datagram).contains(&u8::from(Command::WindowAsk)) {
                saw_probe = true;
            }
            b.input(&datagram).unwrap();
        }
        for datagram in drain(&b_out) {
            a.input(&datagram).unwrap();
        }
        now += 100;
    }

    assert_eq!(a.rmt_wnd, 0);
    let stalled = a.waitsnd();
    assert!(stalled > 0, "sender should still hold undeliverable segments");
    assert!(saw_probe, "no window probe while the remote window was closed");

    // The application finally drains B. The reopened window is advertised
    // unsolicited and A finishes the transfer.
    let mut delivered = 0;
    while b.recv().is_some() {
        delivered += 1;
    }
    let mut saw_advertisement = false;
    while now <= 30_000 {
        a.update(now);
        b.update(now);
        for datagram in drain(&b_out) {
            if commands(&datagram).contains(&u8::from(Command::WindowTell)) {
                saw_advertisement = true;
            }
            a.input(&datagram).unwrap();
        }
        for datagram in drain(&a_out) {
            b.input(&datagram).unwrap();
        }
        while b.recv().is_some() {
            delivered += 1;
        }
        if a.waitsnd() == 0 {
            break;
        }
        now += 100;
    }

    assert!(saw_advertisement, "draining never advertised the new window");
    assert_eq!(a.waitsnd(), 0);
    assert_eq!(delivered, 200);
}

#[test]
fn dead_link_after_too_many_retransmissions() {
    let (mut a, a_out) = conn(CONV);
    a.send(Payload::new("anyone there?")).unwrap();
    assert!(!a.is_dead_link());

    // Never deliver anything; step far enough that every flush times the
    // segment out again.
    let mut now = 0;
    for _ in 0..25 {
        a.update(now);
        now += 60_000;
    }
    let _ = drain(&a_out);

    assert!(a.is_dead_link());
    // The connection still accepts work; tearing down is the host's call
    a.send(Payload::new("still queues")).unwrap();
}

#[test]
fn duplicate_acks_trigger_fast_retransmit() {
    let (mut a, a_out) = conn(CONV);
    a.set_mtu(100).unwrap();
    a.set_nodelay(false, 100, 2, true);
    for _ in 0..4 {
        a.send(vec![5u8; 76]).unwrap();
    }
    a.update(0);
    assert_eq!(drain(&a_out).len(), 4);

    // Acks for later segments arrive in separate datagrams while sn 0 is
    // still outstanding.
    a.input(&ack_bytes(1, 0, WND_RCV)).unwrap();
    a.input(&ack_bytes(2, 0, WND_RCV)).unwrap();

    // Well before the retransmission timeout, the next flush resends sn 0.
    a.update(100);
    let resent: Vec<_> = drain(&a_out)
        .iter()
        .flat_map(|d| {
            let header = Header::decode(d).unwrap();
            (header.cmd == u8::from(Command::Push)).then_some(header.sn)
        })
        .collect();
    assert_eq!(resent, vec![0]);

    // Fast recovery: ssthresh = inflight / 2, window reopens past it
    assert_eq!(a.ssthresh, 2);
    assert_eq!(a.cwnd, 4);
}

#[test]
fn low_latency_profile_under_loss() {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut latencies = Vec::new();
    for _ in 0..300 {
        let (mut a, a_out, mut b, b_out) = pair();
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);
        a.send(vec![7u8; 100]).unwrap();

        let mut latency = 3000;
        for now in (0..3000).step_by(10) {
            a.update(now);
            b.update(now);
            for datagram in drain(&a_out) {
                if rng.gen::<f32>() >= 0.1 {
                    b.input(&datagram).unwrap();
                }
            }
            for datagram in drain(&b_out) {
                if rng.gen::<f32>() >= 0.1 {
                    a.input(&datagram).unwrap();
                }
            }
            if b.recv().is_some() {
                latency = now;
                break;
            }
        }
        latencies.push(latency);
    }

    latencies.sort_unstable();
    let median = latencies[latencies.len() / 2];
    assert!(median < 200, "median delivery latency was {median} ms");
}

#[test]
fn truncated_tail_keeps_earlier_effects() {
    let (mut b, _b_out) = conn(CONV);
    let mut buffer = push_bytes(0, 0, b"ab");
    let second = push_bytes(1, 0, b"cd");
    buffer.extend_from_slice(&second[..second.len() - 1]);

    assert_eq!(
        b.input(&buffer),
        Err(InputError::Truncated {
            expected: 2,
            actual: 1,
        })
    );
    // The first segment was applied before the failure
    assert_eq!(b.recv().unwrap().to_vec(), b"ab");
}

#[test]
fn input_rejects_foreign_and_malformed_segments() {
    let (mut b, _b_out) = conn(CONV);

    assert_eq!(b.input(&[0u8; 10]), Err(InputError::ShortHeader(10)));

    let mut foreign = Vec::new();
    Header {
        conv: CONV + 1,
        cmd: Command::Push.into(),
        frg: 0,
        wnd: 0,
        ts: 0,
        sn: 0,
        una: 0,
        len: 0,
    }
    .encode_into(&mut foreign);
    assert_eq!(
        b.input(&foreign),
        Err(InputError::WrongConv {
            expected: CONV,
            actual: CONV + 1,
        })
    );

    let mut unknown = Vec::new();
    Header {
        conv: CONV,
        cmd: 99,
        frg: 0,
        wnd: 0,
        ts: 0,
        sn: 0,
        una: 0,
        len: 0,
    }
    .encode_into(&mut unknown);
    assert_eq!(b.input(&unknown), Err(InputError::BadCmd(99)));
}

#[test]
fn check_suggests_the_next_deadline() {
    let (mut a, _a_out) = conn(CONV);
    // Before the first update, an update is always due
    assert_eq!(a.check(0), 0);

    a.update(0);
    assert_eq!(a.check(10), 100);
    assert_eq!(a.check(120), 120);

    // A pending retransmission timer can come due before the next flush
    let (mut b, _b_out) = conn(CONV);
    b.set_nodelay(false, 5000, 0, true);
    b.send(Payload::new("x")).unwrap();
    b.update(0);
    // resendts is rto + rto/8 after the first transmission
    assert_eq!(b.check(100), 225);
}

#[test]
fn advertised_window_ignores_out_of_order_segments() {
    let (mut a, a_out, mut b, b_out) = pair();
    a.set_mtu(100).unwrap();
    a.set_nodelay(false, 100, 0, true);
    a.send(vec![1u8; 76]).unwrap();
    a.send(vec![2u8; 76]).unwrap();
    a.update(0);

    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 2);
    // Only the second segment arrives; it sits in the out-of-order buffer
    b.input(&datagrams[1]).unwrap();
    assert_eq!(b.recv(), None);

    b.update(0);
    b.update(100);
    let acks = drain(&b_out);
    assert!(!acks.is_empty());
    let header = Header::decode(&acks[0]).unwrap();
    assert_eq!(header.cmd, u8::from(Command::Ack));
    assert_eq!(header.sn, 1);
    assert_eq!(header.una, 0);
    // The buffered segment does not count against the advertised window
    assert_eq!(header.wnd, WND_RCV);
}

#[test]
fn configuration_bounds() {
    let (mut a, _a_out) = conn(CONV);

    assert_eq!(a.set_mtu(10), Err(ConfigError::InvalidMtu(10)));
    a.set_mtu(50).unwrap();
    assert_eq!(a.mss(), 50 - OVERHEAD);

    a.set_interval(1);
    assert_eq!(a.interval(), 10);
    a.set_interval(99_999);
    assert_eq!(a.interval(), 5000);

    a.set_wndsize(64, 16);
    assert_eq!(a.snd_wnd, 64);
    // The receive window has a hard floor: it must be able to admit a
    // maximally fragmented message
    assert_eq!(a.rcv_wnd, WND_RCV);
    a.set_wndsize(0, 256);
    assert_eq!(a.snd_wnd, 64);
    assert_eq!(a.rcv_wnd, 256);
}
