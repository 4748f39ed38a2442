//! tether-services: session directory, connections, routing and relaying.
//!
//! Everything here is transport-agnostic: sockets arrive as a
//! [`FrameSink`](connection::FrameSink) plus a message stream, and other
//! nodes are reached through a [`RelayClient`](forwarder::RelayClient).

pub mod connection;
pub mod directory;
pub mod forwarder;
pub mod keepalive;
pub mod lifecycle;
pub mod node;
pub mod router;
pub mod store;
pub mod table;

pub use connection::{
    CloseReason, Connection, ConnectionError, ConnectionHandler, FrameSink, TransportError,
    TransportMessage,
};
pub use directory::{DirectoryError, SessionDirectory};
pub use forwarder::{ForwardOutcome, Forwarder, Partition, RelayClient, RelayError};
pub use keepalive::KeepaliveScheduler;
pub use lifecycle::{ConnectRequest, OfflineReport, SessionLifecycle};
pub use node::{NodeContext, NodeError};
pub use router::{BatchReport, PushReport, PushRouter, RouterError};
pub use store::{DirectoryStore, MemoryStore, StoreError};
pub use table::ConnectionTable;
