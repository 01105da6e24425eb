//! TCP bridge between buses in different processes.
//!
//! ```text
//!   process A                                         process B
//! ┌───────────────┐                               ┌───────────────┐
//! │ Bus           │  outbound allow-list          │ Bus           │
//! │   │ publish   │ ─────────────────────────────►│   ▲ publish   │
//! │   ▼           │   [len u32 BE][WirePayload]   │   │           │
//! │ TcpBusClient  │◄───────────────────────────── │ TcpBusServer  │
//! └───────────────┘         inbound allow-list    └───────────────┘
//! ```
//!
//! Both ends share one core:
//!
//! - **Outbound**: the core subscribes on the local bus to every type named
//!   in `outbound` (and so to their descendants) and enqueues each message
//!   on every connection's outbound queue. A writer thread per connection
//!   encodes and frames it.
//! - **Inbound**: a reader thread per connection reassembles frames,
//!   drops types whose name and ancestor names are all missing from
//!   `inbound`, decodes the rest and hands them to an inbound queue that
//!   publishes into the local bus in arrival order.
//! - **Echo**: ids received from a peer are remembered, so a message
//!   arriving from the wire is never sent back out.
//!
//! Errors here are logged, never returned to publishers. A client whose
//! connection drops reconnects with [`Backoff`]; a server keeps accepting.
//!
//! Types must be registered with the [`CodecRegistry`] before the transport
//! starts so that `outbound` names resolve.

mod backoff;
mod client;
mod codec;
mod connection;
mod framing;
mod server;

use std::io;

use thiserror::Error;

pub use backoff::Backoff;
pub use client::TcpBusClient;
pub use codec::{BitcodeSerializer, CodecError, CodecRegistry, MessageSerializer, WirePayload};
pub use framing::{encode_frame, FrameAssembler, FramingError, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX};
pub use server::TcpBusServer;

use crate::queued::QueueError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address `{address}`: {source}")]
    Address {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind `{address}`: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("transport is shutting down")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Counters for one server or client, across all its connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connections_opened: u64,
    pub connect_failures: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Inbound frames dropped by the allow-list.
    pub filtered: u64,
    pub decode_errors: u64,
    pub encode_errors: u64,
}
