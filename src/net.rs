//! Async driver for running connections over UDP.
//!
//! The engine in [`conn`](crate::conn) is deliberately inert: it only acts
//! when the host feeds it packets and clock ticks. This module supplies that
//! host on top of tokio. A [`Conversation`] owns one engine, a UDP socket,
//! and a ticker task that drives retransmission on the schedule the engine
//! asks for. A [`Listener`] shares a single socket between many
//! conversations, routing each arriving datagram by the conversation id in
//! its header and surfacing previously unseen ids through
//! [`accept`](Listener::accept).
//!
//! Both peers must use the same conversation id. A dialer either supplies
//! one agreed out of band or lets [`Conversation::connect`] allocate one at
//! random; the listener side learns the id from the first datagram.

use std::time::Instant;

use crate::conn::{ConfigError, SendError};
use crate::Connection;

mod conversation;
pub use conversation::{Conversation, Tuning};

mod listener;
pub use listener::Listener;

/// Errors from the UDP driver.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// The requested tuning is not valid.
    #[error("invalid tuning: {0}")]
    Config(#[from] ConfigError),
    /// The engine rejected a submission.
    #[error(transparent)]
    Send(#[from] SendError),
    /// The peer has stopped acknowledging for long enough that the engine
    /// declared the link dead.
    #[error("the link is dead: the peer stopped acknowledging")]
    DeadLink,
    /// The listener behind this handle is gone.
    #[error("the listener is closed")]
    Closed,
}

/// The millisecond clock handed to the engine. The engine wants a 32-bit
/// modular timestamp, so the absolute value is irrelevant; only differences
/// matter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

pub(crate) fn build_engine(
    conv: u32,
    tuning: &Tuning,
    output: impl FnMut(&[u8]) + Send + 'static,
) -> Result<Connection, ConfigError> {
    let mut conn = if tuning.stream {
        Connection::new_stream(conv, output)
    } else {
        Connection::new(conv, output)
    };
    conn.set_mtu(tuning.mtu)?;
    conn.set_wndsize(tuning.snd_wnd, tuning.rcv_wnd);
    conn.set_nodelay(tuning.nodelay, tuning.interval, tuning.resend, tuning.nocwnd);
    Ok(conn)
}
