//! Packet queues, TCP/UDP transports and the session registry for matchnet.
//!
//! This crate moves framed packets between the application and remote
//! peers. A [`Session`] owns every [`Transport`] of one kind, gives each
//! peer a [`NodeId`] and runs a background worker that polls the sockets
//! without ever blocking on one peer.
//!
//! ## Features
//!
//! - **TCP Transport**: non-blocking stream transport with orderly close detection
//! - **UDP Transport**: keepalive handshake, liveness timeout, shared listener
//! - **Endpoint Matching**: pluggable policy mapping datagrams to nodes
//! - **Frame Routing**: packet-type dispatch to registered handlers
//!
//! ## Example
//!
//! ```rust,no_run
//! use matchnet_session::{PacketRouter, SessionConfig, SessionEvent, TcpSession};
//! use matchnet_wire::PacketId;
//!
//! # async fn example() -> Result<(), matchnet_session::SessionError> {
//! let session = TcpSession::new(SessionConfig::default());
//! let mut events = session.subscribe();
//! session.start_server(50763, 16).await?;
//!
//! let router = PacketRouter::new();
//! router.register(PacketId::ChatMessage, |node, payload| {
//!     println!("node {} says {:?}", node, payload);
//! });
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Connected { node, .. } = event {
//!         PacketRouter::send_frame(&session, node, PacketId::ChatMessage, b"welcome")?;
//!     }
//!     router.poll(&session);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod matcher;
pub mod queue;
pub mod router;
pub mod session;
pub mod tcp;
pub mod transport;
pub mod udp;

// Re-export main types
pub use config::SessionConfig;
pub use error::{QueueError, SessionError};
pub use event::{
    EventHandlers, NetEventResult, NetEventState, NetEventType, TransportEventHandler,
};
pub use keepalive::{build_keepalive, is_keepalive, parse_keepalive, KEEPALIVE_MARKER};
pub use matcher::{EndpointMatcher, KeepaliveAddressMatcher, PeerView, SourceAddressMatcher};
pub use queue::{PacketQueue, DEFAULT_MTU};
pub use router::{PacketHandler, PacketRouter};
pub use session::{Session, SessionEvent, TcpSession, UdpSession};
pub use tcp::{TcpAcceptor, TcpTransport};
pub use transport::{Listener, NodeId, Transport};
pub use udp::{UdpReceiver, UdpTransport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
