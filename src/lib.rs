//! Point-to-point message transport between the nodes of a cluster.
//!
//! Nodes exchange typed binary [`Message`]s, either fire-and-forget or as [`Request`]s answered
//! by exactly one response. Received messages are handed from the network threads to a small pool
//! of handler threads through lock-free ring queues, so a slow receiver never stalls the sockets.
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod network;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod request_map;
pub mod worker;

pub use config::{ConfigError, NetworkConfig};
pub use connection::{
    loopback::{LoopbackHub, LoopbackTransport},
    manager::ConnectionListener,
    transport::{TcpTransport, Transport, TransportKind},
};
pub use error::NetworkError;
pub use message::{Message, MessageConstructor, MessageKind, MessageReceiver, Request};
pub use network::Network;
pub use node::{NodeEntry, NodeId, NodeMap, StaticNodeMap};
