use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::conversation::{Conversation, Shared, Tuning};
use super::{build_engine, NetError};
use crate::conn::peek_conv;
use crate::FxDashMap;

/// Serves many conversations on a single UDP socket.
///
/// Every arriving datagram is routed by the conversation id at the front of
/// its header. Ids that have not been seen before create a new
/// [`Conversation`] which is handed out through [`accept`](Listener::accept);
/// later datagrams with the same id go straight to that conversation's
/// engine. An id stays claimed by its first peer for the life of the
/// listener.
pub struct Listener {
    socket: Arc<UdpSocket>,
    backlog: mpsc::Receiver<Conversation>,
    demux: JoinHandle<()>,
}

impl Listener {
    /// Binds a listener with default tuning.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        Self::bind_with(addr, Tuning::default()).await
    }

    /// Binds a listener; accepted conversations use the given tuning.
    pub async fn bind_with(addr: SocketAddr, tuning: Tuning) -> Result<Self, NetError> {
        // Surface a bad tuning now rather than per-datagram in the demux task
        build_engine(0, &tuning, |_: &[u8]| {})?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = mpsc::channel(64);
        let demux = tokio::spawn(demux(socket.clone(), tuning, tx));
        Ok(Self {
            socket,
            backlog: rx,
            demux,
        })
    }

    /// The address the listener's socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for a conversation initiated by a previously unseen id.
    pub async fn accept(&mut self) -> Result<Conversation, NetError> {
        self.backlog.recv().await.ok_or(NetError::Closed)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

async fn demux(socket: Arc<UdpSocket>, tuning: Tuning, backlog: mpsc::Sender<Conversation>) {
    let conversations: FxDashMap<u32, Weak<Shared>> = FxDashMap::default();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                debug!(%error, "udp receive failed");
                continue;
            }
        };
        let datagram = &buf[..len];
        let Some(conv) = peek_conv(datagram) else {
            trace!(bytes = len, "datagram too short to carry a segment");
            continue;
        };

        match conversations.entry(conv) {
            Entry::Occupied(entry) => match entry.get().upgrade() {
                Some(shared) => {
                    if shared.peer == from {
                        shared.handle_datagram(datagram);
                    } else {
                        debug!(conv, %from, "conversation id already in use by another peer");
                    }
                }
                None => {
                    // The handle is gone. The id stays retired so a stale
                    // peer cannot resurrect the conversation against a fresh
                    // engine with mismatched sequence state.
                    trace!(conv, "datagram for a dropped conversation");
                }
            },
            Entry::Vacant(entry) => {
                let (conversation, shared) =
                    match Conversation::accepted(socket.clone(), from, conv, &tuning) {
                        Ok(created) => created,
                        Err(error) => {
                            debug!(%error, "could not create conversation");
                            continue;
                        }
                    };
                debug!(conv, %from, "new conversation");
                shared.handle_datagram(datagram);
                entry.insert(Arc::downgrade(&shared));
                if let Err(error) = backlog.try_send(conversation) {
                    warn!(conv, %error, "accept backlog full, dropping conversation");
                    conversations.remove(&conv);
                }
            }
        }
    }
}
