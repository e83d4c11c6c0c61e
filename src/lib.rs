//! A reliable, ordered, datagram-oriented transport engine for lossy links.
//!
//! Generic stream transports trade latency for throughput: a single lost
//! packet stalls delivery until a full retransmission timeout has elapsed.
//! This crate implements an ARQ protocol engine with selective and cumulative
//! acknowledgement, fast retransmission, and a tunable low-latency profile
//! that recovers from loss far sooner than a conventional stream on the same
//! link, at the cost of some extra bandwidth.
//!
//! # Organization
//!
//! - [`Payload`] is a cheaply sliceable and concatenable byte container used
//!   on both sides of the engine.
//! - [`Connection`] is the per-conversation protocol state machine. It is
//!   synchronous and single-owner: the host feeds it packets with
//!   [`Connection::input`], drives it with [`Connection::update`], and
//!   receives outgoing datagrams through a callback.
//! - [`net`] wraps the engine in an async driver over UDP: [`net::Conversation`]
//!   for a single peer and [`net::Listener`] for demultiplexing many
//!   conversations on one socket.
//!
//! # Protocol structure
//!
//! Both peers agree on a 32-bit conversation id out of band. Every segment
//! carries that id, a command byte, and cumulative acknowledgement state, so
//! a single datagram can piggyback data, acks, and window information. The
//! engine never generates traffic on its own; all output happens inside
//! `update`/`flush`, which the host calls on a fixed cadence (or on the
//! schedule suggested by [`Connection::check`]).

pub mod payload;
pub use payload::Payload;

pub mod conn;
pub use conn::{Connection, ConfigError, InputError, SendError};

pub mod net;

use dashmap::DashMap;
use std::hash::BuildHasherDefault;
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
