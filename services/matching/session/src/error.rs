//! Error types for queues, transports and sessions.

use crate::transport::NodeId;
use matchnet_wire::CodecError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by [`PacketQueue`](crate::PacketQueue)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Message exceeds the queue's maximum message size
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    Oversized {
        /// Offered message length
        len: usize,
        /// Maximum accepted length
        max: usize,
    },

    /// Destination buffer cannot hold the next message
    #[error("next message needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall {
        /// Length of the queued message
        needed: usize,
        /// Length of the caller's buffer
        capacity: usize,
    },
}

/// Errors raised by transports and sessions
#[derive(Error, Debug)]
pub enum SessionError {
    /// No transport is registered under this node
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Send or receive queue rejected the operation
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Listening or local socket could not be bound
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Connection attempt failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Peer address
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Transport has no open socket
    #[error("transport is not connected")]
    NotConnected,

    /// Peer address is not a dotted IPv4 address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Frame could not be decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}
