//! Transport capability shared by the TCP and UDP implementations.
//!
//! A transport owns one socket and a pair of [`PacketQueue`]s. Application
//! code only touches the queues through [`Transport::send`] and
//! [`Transport::receive`]; the session worker moves bytes between the
//! queues and the socket by calling [`Transport::dispatch`] every tick.
//!
//! [`PacketQueue`]: crate::PacketQueue

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::TransportEventHandler;
use async_trait::async_trait;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Logical identity of a peer within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One peer connection
///
/// Every method except [`Transport::connect`] is synchronous and never
/// waits on the network.
#[async_trait]
pub trait Transport: Send + Sync + Sized + 'static {
    /// Socket handed over by the listener for accepted peers
    type Socket: Send + 'static;
    /// Listening side paired with this transport
    type Listener: Listener<Self>;

    /// Short protocol name for logs
    const KIND: &'static str;

    /// Create an unconnected transport
    fn new(config: &SessionConfig) -> Self;

    /// Adopt an already connected socket
    fn initialize(&self, socket: Self::Socket) -> Result<(), SessionError>;

    /// Drop the socket and queued data without firing events
    fn terminate(&self);

    /// Node this transport is registered under
    fn node_id(&self) -> Option<NodeId>;

    /// Assign the node identity
    fn set_node_id(&self, node: NodeId);

    /// Address of the local socket
    fn local_endpoint(&self) -> Option<SocketAddr>;

    /// Address of the peer socket, once known
    fn remote_endpoint(&self) -> Option<SocketAddr>;

    /// Port of the owning session's listener
    fn set_server_port(&self, port: u16);

    /// Whether the peer is reachable
    fn is_connected(&self) -> bool;

    /// Open a connection to `address:port`
    ///
    /// Fires a `Connect` event on failure, and on success when the
    /// protocol establishes the connection immediately.
    async fn connect(&self, address: &str, port: u16) -> Result<(), SessionError>;

    /// Close the socket, firing one `Disconnect` event if it was open
    fn disconnect(&self);

    /// Queue one message for sending
    fn send(&self, data: &[u8]) -> Result<usize, SessionError>;

    /// Take one received message, returning 0 when none is pending
    fn receive(&self, buffer: &mut [u8]) -> Result<usize, SessionError>;

    /// Drive non-blocking socket I/O once
    fn dispatch(&self);

    /// Subscribe to lifecycle events
    fn register_event_handler(&self, handler: Arc<dyn TransportEventHandler>);

    /// Remove a subscription
    fn unregister_event_handler(&self, handler: &Arc<dyn TransportEventHandler>);
}

/// Listening socket of a session
#[async_trait]
pub trait Listener<T: Transport>: Send + Sync + Sized + 'static {
    /// Bind on all interfaces at `port` (0 picks a free port)
    async fn bind(port: u16, config: &SessionConfig) -> Result<Self, SessionError>;

    /// Bound address
    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    /// Take one pending inbound connection without waiting
    fn accept(&self) -> Option<T::Socket>;

    /// Deliver pending inbound datagrams to their transports
    fn dispatch_receive(&self, transports: &[(NodeId, Arc<T>)]);
}

/// Node label for log lines, `-` until a node is assigned
pub(crate) fn node_label(node: Option<NodeId>) -> String {
    node.map_or_else(|| "-".to_string(), |node| node.to_string())
}

/// Parse a dotted IPv4 peer address
pub fn parse_peer(address: &str, port: u16) -> Result<SocketAddr, SessionError> {
    address
        .trim()
        .parse::<Ipv4Addr>()
        .map(|ip| SocketAddr::from((ip, port)))
        .map_err(|_| SessionError::InvalidAddress(address.to_string()))
}
