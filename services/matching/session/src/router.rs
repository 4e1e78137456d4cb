//! Frame layer: packet header in front of every payload, and dispatch of
//! received frames to per-packet-type handlers.

use crate::error::SessionError;
use crate::session::Session;
use crate::transport::{NodeId, Transport};
use bytes::Bytes;
use dashmap::DashMap;
use matchnet_wire::{Packet, PacketHeader, PacketId, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Callback receiving the payload of one frame
pub type PacketHandler = Arc<dyn Fn(NodeId, &[u8]) + Send + Sync>;

/// Routes received frames to the handler registered for their packet type
#[derive(Default)]
pub struct PacketRouter {
    handlers: DashMap<PacketId, PacketHandler>,
}

impl fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<PacketId> = self.handlers.iter().map(|e| *e.key()).collect();
        ids.sort();
        f.debug_struct("PacketRouter").field("handlers", &ids).finish()
    }
}

impl PacketRouter {
    /// Create a router with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler for a packet type, replacing any previous one
    pub fn register<F>(&self, packet_id: PacketId, handler: F)
    where
        F: Fn(NodeId, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.insert(packet_id, Arc::new(handler));
    }

    /// Remove the handler for a packet type
    pub fn unregister(&self, packet_id: PacketId) -> bool {
        self.handlers.remove(&packet_id).is_some()
    }

    /// Prefix `payload` with the header for `packet_id`
    pub fn encode_frame(packet_id: PacketId, payload: &[u8]) -> Bytes {
        let mut serializer = Serializer::new();
        PacketHeader::new(packet_id).encode(&mut serializer);
        serializer.encode_bytes(payload, payload.len());
        serializer.into_bytes()
    }

    /// Frame a raw payload and queue it for `node`
    pub fn send_frame<T: Transport>(
        session: &Session<T>,
        node: NodeId,
        packet_id: PacketId,
        payload: &[u8],
    ) -> Result<usize, SessionError> {
        session.send(node, &Self::encode_frame(packet_id, payload))
    }

    /// Encode a packet record and queue it for `node`
    pub fn send_packet<T: Transport, P: Packet>(
        session: &Session<T>,
        node: NodeId,
        packet: &P,
    ) -> Result<usize, SessionError> {
        session.send(node, &packet.to_frame())
    }

    /// Deliver one received frame, returning whether a handler took it
    ///
    /// Frames with an unreadable header, an unknown packet type or no
    /// registered handler are dropped.
    pub fn route(&self, node: NodeId, message: &[u8]) -> bool {
        let (header, payload) = match PacketHeader::split(message) {
            Ok(split) => split,
            Err(e) => {
                debug!("dropping frame from node {}: {}", node, e);
                return false;
            }
        };
        let packet_id = match header.packet_type() {
            Ok(packet_id) => packet_id,
            Err(e) => {
                debug!("dropping frame from node {}: {}", node, e);
                return false;
            }
        };

        let handler = self.handlers.get(&packet_id).map(|e| e.value().clone());
        match handler {
            Some(handler) => {
                handler(node, payload);
                true
            }
            None => {
                debug!("no handler for {} from node {}", packet_id, node);
                false
            }
        }
    }

    /// Drain every node's receive queue through [`PacketRouter::route`]
    ///
    /// Returns the number of frames handed to handlers.
    pub fn poll<T: Transport>(&self, session: &Session<T>) -> usize {
        let mut buffer = vec![0u8; session.config().mtu];
        let mut routed = 0;
        for node in session.nodes() {
            while let Ok(n) = session.receive(node, &mut buffer) {
                if n == 0 {
                    break;
                }
                if self.route(node, &buffer[..n]) {
                    routed += 1;
                }
            }
        }
        routed
    }
}
