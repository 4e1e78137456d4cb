//! Endpoint matching policies for the shared UDP listener.
//!
//! The listener receives datagrams from every peer on one socket and has to
//! decide which transport each belongs to. Keepalives and data datagrams are
//! resolved separately.

use crate::transport::NodeId;
use std::fmt::Debug;
use std::net::SocketAddr;

/// Addressing state of one UDP transport as seen by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    /// Node the transport is registered under
    pub node: NodeId,
    /// Peer listening endpoint the transport was connected to
    pub target: Option<SocketAddr>,
    /// Peer socket learned from its keepalives
    pub remote: Option<SocketAddr>,
}

/// Policy resolving inbound datagrams to nodes
pub trait EndpointMatcher: Send + Sync + Debug {
    /// Resolve a keepalive
    ///
    /// `announced` is the endpoint embedded in the keepalive text, when it
    /// parsed; `source` is the socket address it was received from.
    fn match_keepalive(
        &self,
        announced: Option<SocketAddr>,
        source: SocketAddr,
        peers: &[PeerView],
    ) -> Option<NodeId>;

    /// Resolve an application datagram by its source address
    fn match_datagram(&self, source: SocketAddr, peers: &[PeerView]) -> Option<NodeId> {
        peers
            .iter()
            .find(|peer| peer.remote == Some(source))
            .map(|peer| peer.node)
    }
}

/// Match keepalives on the announced `IP:port`
///
/// Lets several peers share one host or NAT address: each announces the
/// port of its own listener, which is what the local side connected to.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepaliveAddressMatcher;

impl EndpointMatcher for KeepaliveAddressMatcher {
    fn match_keepalive(
        &self,
        announced: Option<SocketAddr>,
        _source: SocketAddr,
        peers: &[PeerView],
    ) -> Option<NodeId> {
        let announced = announced?;
        peers
            .iter()
            .find(|peer| peer.target == Some(announced))
            .map(|peer| peer.node)
    }
}

/// Match keepalives on the source IP alone
///
/// One peer per IP address; the keepalive text is ignored. Once a peer's
/// socket is known, keepalives from it keep matching that node.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceAddressMatcher;

impl EndpointMatcher for SourceAddressMatcher {
    fn match_keepalive(
        &self,
        _announced: Option<SocketAddr>,
        source: SocketAddr,
        peers: &[PeerView],
    ) -> Option<NodeId> {
        if let Some(peer) = peers.iter().find(|peer| peer.remote == Some(source)) {
            return Some(peer.node);
        }
        peers
            .iter()
            .find(|peer| peer.target.map(|t| t.ip()) == Some(source.ip()))
            .map(|peer| peer.node)
    }
}
