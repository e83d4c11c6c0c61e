//! The per-conversation protocol state machine.
//!
//! [`Connection`] implements reliable, ordered delivery over an unreliable
//! datagram substrate. It is implemented separately from the async driver in
//! [`net`](crate::net) so that it can be tested deterministically outside of
//! a runtime: the host owns the clock, feeds arriving datagrams to
//! [`input`](Connection::input), drives retransmission with
//! [`update`](Connection::update), and receives outgoing datagrams through a
//! callback invoked synchronously during flushes.
//!
//! Internally a connection moves segments between four buffers. Submitted
//! payloads are fragmented into `snd_queue`, promoted into `snd_buf` as the
//! congestion and remote windows allow, and retired from `snd_buf` by the
//! peer's cumulative and selective acknowledgements. Arriving pushes land in
//! the sorted `rcv_buf`, migrate to `rcv_queue` once they are contiguous, and
//! leave through [`recv`](Connection::recv). Loss is repaired three ways:
//! per-segment retransmission timers, fast retransmission once enough later
//! segments have been acked past a missing one, and a TCP-like congestion
//! window (slow start, congestion avoidance, multiplicative decrease) that
//! keeps the repair traffic itself from collapsing the link.

use std::cmp;
use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::Payload;

mod modular_cmp;
use modular_cmp::diff;

mod segment;
pub use segment::{peek_conv, Command, Header, OVERHEAD};
use segment::Segment;

#[cfg(test)]
mod tests;

/// Minimum retransmission timeout in the low-latency profile, ms
pub const RTO_NDL: u32 = 30;
/// Minimum retransmission timeout, ms
pub const RTO_MIN: u32 = 100;
/// Initial retransmission timeout, ms
pub const RTO_DEF: u32 = 200;
/// Ceiling on the retransmission timeout, ms
pub const RTO_MAX: u32 = 60000;
/// Default send window, segments
pub const WND_SND: u16 = 32;
/// Default and minimum receive window, segments. The receive window may not
/// shrink below this because it must admit a maximally fragmented message.
pub const WND_RCV: u16 = 128;
/// Default maximum transmission unit, bytes
pub const MTU_DEF: usize = 1400;
/// Suggested duplicate-ack threshold for fast retransmission
pub const ACK_FAST: u32 = 3;
/// Default flush interval, ms
pub const INTERVAL: u32 = 100;
/// Retransmissions of a single segment after which the link is declared dead
pub const DEADLINK: u32 = 20;
/// Initial slow-start threshold, segments
pub const THRESH_INIT: u16 = 2;
/// Floor on the slow-start threshold, segments
pub const THRESH_MIN: u16 = 2;
/// Initial zero-window probe delay, ms
pub const PROBE_INIT: u32 = 7000;
/// Ceiling on the zero-window probe delay, ms
pub const PROBE_LIMIT: u32 = 120000;

/// Probe flag: a window-ask should be sent on the next flush
const ASK_SEND: u8 = 1;
/// Probe flag: a window advertisement should be sent on the next flush
const ASK_TELL: u8 = 2;

/// The capability a connection emits datagrams through. Called synchronously
/// from within a flush; it must not re-enter the connection.
pub type Output = Box<dyn FnMut(&[u8]) + Send>;

/// Errors from [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The payload would fragment into at least a full receive window of
    /// segments and could never be reassembled by the peer.
    #[error("message needs {0} fragments, which exceeds the receive window")]
    MessageTooLarge(usize),
}

/// Errors from [`Connection::input`]. Segments parsed before the failing one
/// keep their effects; the connection remains usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// The datagram is too short to hold a segment header.
    #[error("datagram of {0} bytes is shorter than a segment header")]
    ShortHeader(usize),
    /// The segment belongs to a different conversation.
    #[error("segment conversation id {actual} does not match {expected}")]
    WrongConv { expected: u32, actual: u32 },
    /// The datagram ends in the middle of a segment's payload.
    #[error("segment declares {expected} payload bytes but only {actual} follow")]
    Truncated { expected: usize, actual: usize },
    /// The command byte is not one of the four known commands.
    #[error("unknown command byte {0}")]
    BadCmd(u8),
}

/// Errors from the configuration setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The MTU cannot fit a segment header, or is below the 50-byte floor.
    #[error("mtu of {0} bytes is too small")]
    InvalidMtu(usize),
}

/// A reliable, ordered connection over an unreliable datagram substrate.
///
/// A connection is single-owner and never blocks: every method runs to
/// completion, and the only I/O is the output callback invoked during
/// flushes. Both peers must construct their connection with the same
/// conversation id, agreed out of band.
///
/// Time is supplied by the host as a 32-bit millisecond count. It may wrap;
/// all internal comparisons are modular.
pub struct Connection {
    conv: u32,
    mtu: usize,
    mss: usize,
    /// 0 while healthy, -1 once a segment has exceeded the dead-link
    /// retransmission count
    state: i32,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u16,

    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    /// The peer's most recently advertised free receive window
    rmt_wnd: u16,
    cwnd: u16,
    probe: u8,

    current: u32,
    interval: u32,
    ts_flush: u32,
    /// Total retransmissions over the life of the connection
    xmit: u32,

    nodelay: bool,
    updated: bool,

    ts_probe: u32,
    probe_wait: u32,

    dead_link: u32,
    /// Congestion window growth accumulator, bytes
    incr: usize,

    snd_queue: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,

    /// (sn, ts) pairs to acknowledge on the next flush
    acklist: VecDeque<(u32, u32)>,
    /// Datagram packing buffer
    buf: Vec<u8>,

    fastresend: u32,
    nocwnd: bool,
    stream: bool,

    output: Output,
}

impl Connection {
    /// Creates a connection in message mode: each submitted payload is
    /// delivered as one [`recv`](Connection::recv) of exactly the same bytes.
    pub fn new(conv: u32, output: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self::construct(conv, Box::new(output), false)
    }

    /// Creates a connection in stream mode: submitted bytes coalesce into as
    /// few segments as possible and message boundaries are not preserved.
    pub fn new_stream(conv: u32, output: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self::construct(conv, Box::new(output), true)
    }

    fn construct(conv: u32, output: Output, stream: bool) -> Self {
        Self {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - OVERHEAD,
            state: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 0,
            probe: 0,
            current: 0,
            interval: INTERVAL,
            ts_flush: INTERVAL,
            xmit: 0,
            nodelay: false,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            dead_link: DEADLINK,
            incr: 0,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: VecDeque::new(),
            buf: Vec::with_capacity((MTU_DEF + OVERHEAD) * 3),
            fastresend: 0,
            nocwnd: false,
            stream,
            output,
        }
    }

    /// The conversation id this connection was created with.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// The current maximum transmission unit.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The maximum segment payload size, `mtu` minus the header overhead.
    pub fn mss(&self) -> usize {
        self.mss
    }

    /// The flush interval in milliseconds.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Whether some segment has been retransmitted more than the dead-link
    /// threshold. The connection keeps operating, but the host should tear
    /// it down; the peer is not responding.
    pub fn is_dead_link(&self) -> bool {
        self.state != 0
    }

    /// The number of segments queued or in flight on the send side.
    pub fn waitsnd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Submits a payload for delivery to the peer.
    ///
    /// In message mode the payload is fragmented into up to `WND_RCV - 1`
    /// segments and delivered to the peer as a single unit. In stream mode
    /// bytes are appended to the most recent unsent segment first, and an
    /// empty submission is a no-op.
    pub fn send(&mut self, data: impl Into<Payload>) -> Result<(), SendError> {
        let mut data = data.into();

        // Stream mode tops up the tail of the queue before starting fresh
        // segments.
        if self.stream {
            if let Some(tail) = self.snd_queue.back_mut() {
                let have = tail.data.len();
                if have < self.mss {
                    let extend = cmp::min(data.len(), self.mss - have);
                    tail.data.concatenate(data.cut(extend));
                    tail.header.len = tail.data.len() as u32;
                    tail.header.frg = 0;
                }
            }
            if data.is_empty() {
                return Ok(());
            }
        }

        let count = if data.len() <= self.mss {
            1
        } else {
            (data.len() + self.mss - 1) / self.mss
        };
        if count >= WND_RCV as usize {
            debug!(bytes = data.len(), fragments = count, "send: message too large");
            return Err(SendError::MessageTooLarge(count));
        }

        for i in 0..count {
            let size = cmp::min(self.mss, data.len());
            let mut seg = Segment::with_data(data.cut(size));
            seg.header.frg = if self.stream {
                0
            } else {
                (count - i - 1) as u8
            };
            self.snd_queue.push_back(seg);
        }

        Ok(())
    }

    /// The size of the next complete message waiting in the receive queue,
    /// or `None` if no complete message has arrived yet.
    pub fn peeksize(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.header.frg == 0 {
            return Some(front.data.len());
        }
        if self.rcv_queue.len() < front.header.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.header.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Takes the next complete message off the receive queue, reassembling
    /// fragments. Returns `None` until a complete message is available.
    pub fn recv(&mut self) -> Option<Payload> {
        let peeksize = self.peeksize()?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut data = Payload::default();
        while let Some(seg) = self.rcv_queue.pop_front() {
            trace!(sn = seg.header.sn, "recv");
            let fragment = seg.header.frg;
            data.concatenate(seg.data);
            if fragment == 0 {
                break;
            }
        }
        debug_assert_eq!(data.len(), peeksize);

        self.move_buf();

        // Draining a saturated queue reopens the window; advertise it on the
        // next flush so the peer stops backing off.
        if self.rcv_queue.len() < self.rcv_wnd as usize && recover {
            self.probe |= ASK_TELL;
        }

        Some(data)
    }

    fn update_ack(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = cmp::max((7 * self.rx_srtt + rtt) / 8, 1);
        }
        let rto = self.rx_srtt + cmp::max(self.interval, 4 * self.rx_rttval);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.header.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let d = diff(sn, self.snd_buf[i].header.sn);
            if d == 0 {
                self.snd_buf.remove(i);
                break;
            }
            if d < 0 {
                break;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        // Strict: a segment whose sn equals una is still in flight
        while let Some(seg) = self.snd_buf.front() {
            if diff(una, seg.header.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in &mut self.snd_buf {
            if diff(sn, seg.header.sn) < 0 {
                break;
            }
            if sn != seg.header.sn {
                seg.fastack += 1;
            }
        }
    }

    fn ack_push(&mut self, sn: u32, ts: u32) {
        self.acklist.push_back((sn, ts));
    }

    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.header.sn;
        if diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) >= 0
            || diff(sn, self.rcv_nxt) < 0
        {
            return;
        }

        // Arrivals tend to be near the tail, so scan from the back for the
        // insertion point.
        let mut repeat = false;
        let mut index = self.rcv_buf.len();
        for existing in self.rcv_buf.iter().rev() {
            if existing.header.sn == sn {
                repeat = true;
                break;
            }
            if diff(sn, existing.header.sn) > 0 {
                break;
            }
            index -= 1;
        }

        if !repeat {
            self.rcv_buf.insert(index, seg);
        }

        self.move_buf();
    }

    /// Promotes contiguous segments from the sorted out-of-order buffer into
    /// the receive queue.
    fn move_buf(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.header.sn != self.rcv_nxt || self.rcv_queue.len() >= self.rcv_wnd as usize {
                break;
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    /// Processes one raw datagram from the peer: zero or more concatenated
    /// segments.
    ///
    /// An error mid-datagram does not roll back the segments already
    /// applied; connection state only moves forward, so replaying or
    /// reordering datagrams is always safe.
    pub fn input(&mut self, data: &[u8]) -> Result<(), InputError> {
        trace!(bytes = data.len(), "input");
        if data.len() < OVERHEAD {
            return Err(InputError::ShortHeader(data.len()));
        }

        let prev_una = self.snd_una;
        let mut acked = false;
        let mut maxack = 0;

        let mut rest = data;
        while rest.len() >= OVERHEAD {
            let header = Header::decode(rest)?;
            if header.conv != self.conv {
                debug!(
                    expected = self.conv,
                    actual = header.conv,
                    "input: conversation mismatch"
                );
                return Err(InputError::WrongConv {
                    expected: self.conv,
                    actual: header.conv,
                });
            }

            let len = header.len as usize;
            let body = &rest[OVERHEAD..];
            if body.len() < len {
                debug!(
                    expected = len,
                    actual = body.len(),
                    "input: truncated segment"
                );
                return Err(InputError::Truncated {
                    expected: len,
                    actual: body.len(),
                });
            }
            let cmd = Command::try_from(header.cmd)?;

            self.rmt_wnd = header.wnd;
            self.parse_una(header.una);
            self.shrink_buf();

            match cmd {
                Command::Ack => {
                    let rtt = diff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    if !acked {
                        acked = true;
                        maxack = header.sn;
                    } else if diff(header.sn, maxack) > 0 {
                        maxack = header.sn;
                    }
                    trace!(sn = header.sn, rtt, rto = self.rx_rto, "input: ack");
                }
                Command::Push => {
                    if diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) < 0 {
                        self.ack_push(header.sn, header.ts);
                        if diff(header.sn, self.rcv_nxt) >= 0 {
                            self.parse_data(Segment::new(header, Payload::new(&body[..len])));
                        }
                    }
                }
                Command::WindowAsk => {
                    trace!("input: window probe");
                    self.probe |= ASK_TELL;
                }
                Command::WindowTell => {
                    // The advertised window was already absorbed above
                    trace!(wnd = header.wnd, "input: window advertisement");
                }
            }

            rest = &body[len..];
        }

        if acked {
            self.parse_fastack(maxack);
        }

        // Growth of the cumulative ack opens the congestion window: slow
        // start below ssthresh, additive increase above it.
        if diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += mss * mss / self.incr + mss / 16;
                if (self.cwnd as usize + 1) * mss <= self.incr {
                    self.cwnd += 1;
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd as usize * mss;
            }
        }

        Ok(())
    }

    /// The free receive window to advertise, in segments.
    fn wnd_unused(&self) -> u16 {
        if self.rcv_queue.len() < self.rcv_wnd as usize {
            self.rcv_wnd - self.rcv_queue.len() as u16
        } else {
            0
        }
    }

    /// Assembles and emits everything currently owed to the peer: pending
    /// acks, window probes and advertisements, new data admitted by the
    /// effective window, and retransmissions. Multiple segments are packed
    /// into each datagram up to the MTU.
    ///
    /// Does nothing until [`update`](Connection::update) has been called
    /// once to establish the time base.
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused();
        let una = self.rcv_nxt;

        // Pending acks ride ahead of everything else
        for &(sn, ts) in &self.acklist {
            if self.buf.len() + OVERHEAD > self.mtu {
                (self.output)(&self.buf);
                self.buf.clear();
            }
            Header {
                conv: self.conv,
                cmd: Command::Ack.into(),
                frg: 0,
                wnd,
                ts,
                sn,
                una,
                len: 0,
            }
            .encode_into(&mut self.buf);
        }
        self.acklist.clear();

        // While the peer advertises a closed window, probe it on a growing
        // back-off schedule.
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
                trace!(wait = self.probe_wait, "scheduling window probe");
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        for (flag, cmd) in [(ASK_SEND, Command::WindowAsk), (ASK_TELL, Command::WindowTell)] {
            if self.probe & flag != 0 {
                if self.buf.len() + OVERHEAD > self.mtu {
                    (self.output)(&self.buf);
                    self.buf.clear();
                }
                Header {
                    conv: self.conv,
                    cmd: cmd.into(),
                    frg: 0,
                    wnd,
                    ts: 0,
                    sn: 0,
                    una,
                    len: 0,
                }
                .encode_into(&mut self.buf);
            }
        }
        self.probe = 0;

        // The effective window: the smaller of ours and the peer's, further
        // narrowed by the congestion window unless disabled.
        let mut cwnd = cmp::min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            cwnd = cmp::min(self.cwnd, cwnd);
        }

        // Admit queued segments into the send buffer
        while diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd as u32)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.header.conv = self.conv;
            seg.header.cmd = Command::Push.into();
            seg.header.wnd = wnd;
            seg.header.ts = current;
            seg.header.sn = self.snd_nxt;
            seg.header.una = self.rcv_nxt;
            seg.resendts = current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;

        for seg in &mut self.snd_buf {
            let mut needsend = false;
            if seg.xmit == 0 {
                // First transmission
                needsend = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resendts = current.wrapping_add(seg.rto).wrapping_add(rtomin);
            } else if diff(current, seg.resendts) >= 0 {
                // Retransmission timeout, with back-off
                needsend = true;
                seg.xmit += 1;
                self.xmit += 1;
                if self.nodelay {
                    seg.rto += self.rx_rto / 2;
                } else {
                    seg.rto += self.rx_rto;
                }
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
                trace!(sn = seg.header.sn, xmit = seg.xmit, "retransmit on timeout");
            } else if seg.fastack >= resent {
                // Enough later segments were acked past this one
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                change = true;
                trace!(sn = seg.header.sn, xmit = seg.xmit, "fast retransmit");
            }

            if needsend {
                seg.header.ts = current;
                seg.header.wnd = wnd;
                seg.header.una = self.rcv_nxt;

                if self.buf.len() + OVERHEAD + seg.data.len() > self.mtu {
                    (self.output)(&self.buf);
                    self.buf.clear();
                }
                seg.encode_into(&mut self.buf);

                if seg.xmit >= self.dead_link {
                    self.state = -1;
                    warn!(
                        sn = seg.header.sn,
                        xmit = seg.xmit,
                        "dead link: retransmission limit reached"
                    );
                }
            }
        }

        if !self.buf.is_empty() {
            (self.output)(&self.buf);
            self.buf.clear();
        }

        // Congestion reaction: fast retransmission halves to the inflight
        // count, a timeout collapses the window entirely.
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = cmp::max((inflight / 2) as u16, THRESH_MIN);
            self.cwnd = self.ssthresh + resent as u16;
            self.incr = self.cwnd as usize * self.mss;
        }

        if lost {
            self.ssthresh = cmp::max(cwnd / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss;
        }

        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss;
        }
    }

    /// Advances the connection's clock and flushes if the interval has
    /// elapsed. Call on a steady cadence, or on the schedule suggested by
    /// [`check`](Connection::check).
    pub fn update(&mut self, current: u32) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = diff(current, self.ts_flush);

        // The host's clock jumped; resynchronize
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// The absolute millisecond timestamp at which [`update`](Connection::update)
    /// next needs to run: the sooner of the next scheduled flush and the
    /// earliest retransmission timer, never more than one interval away.
    /// Returns `current` when an update is already due.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if diff(current, ts_flush) >= 10000 || diff(current, ts_flush) < -10000 {
            ts_flush = current;
        }
        if diff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = diff(ts_flush, current) as u32;
        let mut tm_packet = u32::MAX;
        for seg in &self.snd_buf {
            let d = diff(seg.resendts, current);
            if d <= 0 {
                return current;
            }
            if (d as u32) < tm_packet {
                tm_packet = d as u32;
            }
        }

        let minimal = cmp::min(cmp::min(tm_packet, tm_flush), self.interval);
        current.wrapping_add(minimal)
    }

    /// Changes the maximum transmission unit. Fails below the 50-byte floor.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), ConfigError> {
        if mtu < 50 || mtu < OVERHEAD {
            return Err(ConfigError::InvalidMtu(mtu));
        }
        self.mtu = mtu;
        self.mss = mtu - OVERHEAD;
        Ok(())
    }

    /// Sets the flush interval in milliseconds, clamped to [10, 5000].
    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval.clamp(10, 5000);
    }

    /// Sets the send and receive windows, in segments. Zero leaves a window
    /// unchanged. The receive window cannot shrink below [`WND_RCV`].
    pub fn set_wndsize(&mut self, snd: u16, rcv: u16) {
        if snd > 0 {
            self.snd_wnd = snd;
        }
        if rcv > 0 {
            self.rcv_wnd = cmp::max(rcv, WND_RCV);
        }
    }

    /// Selects the latency profile.
    ///
    /// `nodelay` lowers the retransmission timeout floor and softens the
    /// timeout back-off. `interval` is the flush cadence in milliseconds.
    /// `resend` enables fast retransmission after that many out-of-order
    /// acks (0 disables it). `nocwnd` disables the congestion window so
    /// only the configured and remote windows limit sending.
    ///
    /// The lowest-latency profile is `set_nodelay(true, 10, 2, true)`.
    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nocwnd: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { RTO_NDL } else { RTO_MIN };
        self.set_interval(interval);
        self.fastresend = resend;
        self.nocwnd = nocwnd;
    }
}
