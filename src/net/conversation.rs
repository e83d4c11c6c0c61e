use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{build_engine, Clock, NetError};
use crate::conn::{INTERVAL, MTU_DEF, WND_RCV, WND_SND};
use crate::{Connection, Payload};

/// Engine parameters applied to a conversation when it is created.
///
/// The default profile matches the engine defaults: reliable, congestion
/// controlled, 100 ms flush cadence. [`Tuning::low_latency`] trades bandwidth
/// for delivery latency on lossy links.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Maximum transmission unit for emitted datagrams
    pub mtu: usize,
    /// Flush cadence in milliseconds
    pub interval: u32,
    /// Send window, segments
    pub snd_wnd: u16,
    /// Receive window, segments
    pub rcv_wnd: u16,
    /// Lower the retransmission timeout floor and soften its back-off
    pub nodelay: bool,
    /// Fast-retransmit after this many out-of-order acks; 0 disables
    pub resend: u32,
    /// Disable the congestion window
    pub nocwnd: bool,
    /// Stream mode: coalesce submissions instead of preserving message
    /// boundaries
    pub stream: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            mtu: MTU_DEF,
            interval: INTERVAL,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            nodelay: false,
            resend: 0,
            nocwnd: false,
            stream: false,
        }
    }
}

impl Tuning {
    /// The most aggressive profile: 10 ms cadence, fast retransmission after
    /// two out-of-order acks, no congestion window.
    pub fn low_latency() -> Self {
        Self {
            interval: 10,
            nodelay: true,
            resend: 2,
            nocwnd: true,
            ..Self::default()
        }
    }
}

/// The state shared between a conversation handle and its driver tasks.
pub(crate) struct Shared {
    pub peer: SocketAddr,
    conn: Mutex<Connection>,
    /// Signalled whenever a complete message may be waiting, and on death
    readable: Notify,
    dead: AtomicBool,
    clock: Clock,
}

impl Shared {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        conv: u32,
        tuning: &Tuning,
    ) -> Result<Arc<Self>, NetError> {
        // The engine's egress capability: fire the datagram at the peer and
        // otherwise let it go. A datagram dropped here is no different from
        // one dropped on the wire; the engine will retransmit.
        let output = move |bytes: &[u8]| {
            if let Err(error) = socket.try_send_to(bytes, peer) {
                trace!(%error, "dropped outgoing datagram");
            }
        };
        let conn = build_engine(conv, tuning, output)?;
        Ok(Arc::new(Self {
            peer,
            conn: Mutex::new(conn),
            readable: Notify::new(),
            dead: AtomicBool::new(false),
            clock: Clock::start(),
        }))
    }

    /// Feeds one raw datagram to the engine.
    pub fn handle_datagram(&self, datagram: &[u8]) {
        let mut conn = self.conn.lock().unwrap();
        match conn.input(datagram) {
            Ok(()) => {
                if conn.peeksize().is_some() {
                    self.readable.notify_one();
                }
            }
            Err(error) => debug!(%error, "discarded datagram"),
        }
    }
}

/// Drives the engine's flush schedule until the link dies or the
/// conversation is dropped.
async fn tick(shared: Arc<Shared>) {
    loop {
        let (now, next) = {
            let mut conn = shared.conn.lock().unwrap();
            let now = shared.clock.now();
            conn.update(now);
            if conn.is_dead_link() {
                shared.dead.store(true, Ordering::Release);
                shared.readable.notify_one();
                debug!(peer = %shared.peer, "conversation died");
                return;
            }
            (now, conn.check(now))
        };
        tokio::time::sleep(Duration::from_millis(u64::from(next.wrapping_sub(now)))).await;
    }
}

/// Forwards datagrams from a dialer's private socket into the engine.
async fn read(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from == shared.peer {
                    shared.handle_datagram(&buf[..len]);
                } else {
                    trace!(%from, "ignored datagram from unknown source");
                }
            }
            Err(error) => debug!(%error, "udp receive failed"),
        }
    }
}

/// One reliable, ordered conversation with a single peer.
///
/// Obtained either actively through [`connect`](Conversation::connect) or
/// passively from [`Listener::accept`](super::Listener::accept). Dropping
/// the handle stops its driver tasks; anything still queued is abandoned.
pub struct Conversation {
    shared: Arc<Shared>,
    conv: u32,
    ticker: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

impl Conversation {
    /// Opens a conversation to `remote` on a fresh local socket, using the
    /// given conversation id or allocating a random one.
    pub async fn connect(remote: SocketAddr, conv: Option<u32>) -> Result<Self, NetError> {
        Self::connect_with(remote, conv, Tuning::default()).await
    }

    /// As [`connect`](Conversation::connect), with explicit tuning.
    pub async fn connect_with(
        remote: SocketAddr,
        conv: Option<u32>,
        tuning: Tuning,
    ) -> Result<Self, NetError> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let conv = conv.unwrap_or_else(rand::random);
        let shared = Shared::new(socket.clone(), remote, conv, &tuning)?;
        let reader = tokio::spawn(read(socket, shared.clone()));
        let ticker = tokio::spawn(tick(shared.clone()));
        Ok(Self {
            shared,
            conv,
            ticker,
            reader: Some(reader),
        })
    }

    /// Wraps an engine for a conversation demultiplexed off a shared
    /// listener socket. The listener feeds it datagrams; only the ticker
    /// runs here.
    pub(crate) fn accepted(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        conv: u32,
        tuning: &Tuning,
    ) -> Result<(Self, Arc<Shared>), NetError> {
        let shared = Shared::new(socket, peer, conv, tuning)?;
        let ticker = tokio::spawn(tick(shared.clone()));
        let conversation = Self {
            shared: shared.clone(),
            conv,
            ticker,
            reader: None,
        };
        Ok((conversation, shared))
    }

    /// The conversation id carried by every datagram of this conversation.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// The peer's address.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Submits a payload for delivery. It is queued immediately and goes out
    /// with the next flush; there is no backpressure beyond the engine's
    /// windows.
    pub fn send(&self, data: impl Into<Payload>) -> Result<(), NetError> {
        if self.shared.dead.load(Ordering::Acquire) {
            return Err(NetError::DeadLink);
        }
        let mut conn = self.shared.conn.lock().unwrap();
        conn.send(data)?;
        Ok(())
    }

    /// Waits for the next complete message from the peer.
    pub async fn recv(&self) -> Result<Payload, NetError> {
        loop {
            {
                let mut conn = self.shared.conn.lock().unwrap();
                if let Some(payload) = conn.recv() {
                    return Ok(payload);
                }
            }
            if self.shared.dead.load(Ordering::Acquire) {
                // Pass the wakeup on to any other waiter
                self.shared.readable.notify_one();
                return Err(NetError::DeadLink);
            }
            self.shared.readable.notified().await;
        }
    }

    /// The number of segments queued or in flight on the send side.
    pub fn waitsnd(&self) -> usize {
        self.shared.conn.lock().unwrap().waitsnd()
    }

    /// Whether the engine has given up on the peer.
    pub fn is_dead_link(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.ticker.abort();
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}
