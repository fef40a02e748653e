//! Polling TCP transport.
//!
//! This module owns everything below the message layer: the non-blocking
//! socket wrapper, the table of live connections and the three loops that
//! move bytes between the wire and the application.
//!
//! # Overview
//!
//! A [`TcpServer`] runs three threads once started:
//!
//! - the **accept loop** polls the listening socket and admits new clients
//!   into the [`ConnectionTable`];
//! - the **transfer loop** snapshots the table, polls every client for
//!   readability (and writability when it has queued bytes), pushes what it
//!   reads onto a bounded inbound queue and drains outbound queues onto the
//!   wire;
//! - the **process loop** pops [`Inbound`] events and hands them to the
//!   receive and disconnect callbacks, so slow handlers never stall
//!   readiness detection.
//!
//! A connection's disconnect travels down the same queue as its bytes, after
//! the last packet read from it.
//!
//! The table lock is only held while taking a snapshot or changing the set
//! of connections, never across a poll. Each connection's outbound queue has
//! its own lock.
//!
//! # Ordering
//!
//! Bytes from one connection are delivered in arrival order and queued
//! chunks are written in enqueue order. Nothing is ordered across
//! connections.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): framing and typed dispatch on top of this transport.
mod accept;
mod config;
mod connection;
mod process;
mod server;
mod socket;
mod thread;
mod transfer;

use std::{net::SocketAddr, sync::Arc};

pub use config::{
    DEFAULT_BACKLOG, DEFAULT_INBOUND_QUEUE_CAPACITY, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE,
    TransportConfig,
};
pub use connection::{
    Connection, ConnectionId, ConnectionTable, Inbound, InboundPacket, Snapshot,
};
pub use server::{ServerError, TcpServer};
pub use socket::{Socket, SocketError, SocketResult};
pub use thread::{StopSignal, Worker};

pub type ConnectCallback = Arc<dyn Fn(ConnectionId, SocketAddr) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;
pub type ReceiveCallback = Arc<dyn Fn(InboundPacket) + Send + Sync>;
pub type AddressCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;
