//! Session manager owning every transport of one kind.
//!
//! A [`Session`] allocates node identities, keeps the node registry and runs
//! one background worker that, every tick, accepts pending connections,
//! dispatches each transport and lets the listener deliver shared-socket
//! datagrams. The worker iterates over a snapshot of the registry, so
//! application calls may join or remove nodes while it runs.
//!
//! Lifecycle changes are published as [`SessionEvent`]s on channels handed
//! out by [`Session::subscribe`].

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::{NetEventResult, NetEventState, NetEventType, TransportEventHandler};
use crate::lock;
use crate::tcp::TcpTransport;
use crate::transport::{Listener, NodeId, Transport};
use crate::udp::UdpTransport;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Session over TCP transports
pub type TcpSession = Session<TcpTransport>;

/// Session over UDP transports
pub type UdpSession = Session<UdpTransport>;

/// Lifecycle notification published by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A node became reachable
    Connected {
        /// Node identity
        node: NodeId,
        /// Peer socket address, when known
        peer: Option<SocketAddr>,
    },
    /// An outbound connection attempt failed; no node was allocated
    ConnectFailed {
        /// Address that was dialled
        target: String,
    },
    /// A node left the registry
    Disconnected {
        /// Node identity
        node: NodeId,
    },
    /// A socket error was reported for a node that stays registered
    TransportError {
        /// Node identity
        node: NodeId,
        /// Which direction failed
        kind: NetEventType,
    },
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct SessionShared<T: Transport> {
    config: SessionConfig,
    transports: DashMap<NodeId, Arc<T>>,
    next_node: Mutex<u64>,
    listener: Mutex<Option<Arc<T::Listener>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    worker: Mutex<Option<Worker>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    relay: Arc<dyn TransportEventHandler>,
    max_connections: AtomicUsize,
    is_server: AtomicBool,
}

/// Forwards transport events into the owning session
struct SessionRelay<T: Transport> {
    shared: Weak<SessionShared<T>>,
}

impl<T: Transport> fmt::Debug for SessionRelay<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRelay").field("kind", &T::KIND).finish()
    }
}

impl<T: Transport> TransportEventHandler for SessionRelay<T> {
    fn on_event(&self, state: NetEventState) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_transport_event(state);
        }
    }
}

impl<T: Transport> SessionShared<T> {
    /// Register a transport under a fresh node
    fn join(&self, transport: Arc<T>) -> NodeId {
        let mut next = lock(&self.next_node);
        self.insert(&mut next, transport)
    }

    /// Register a transport unless `limit` nodes are already live
    ///
    /// The count check and the insert happen under the node counter lock,
    /// so concurrent joins cannot push the registry past the limit.
    fn admit(&self, transport: Arc<T>, limit: usize) -> Option<NodeId> {
        let mut next = lock(&self.next_node);
        if self.transports.len() >= limit {
            return None;
        }
        Some(self.insert(&mut next, transport))
    }

    fn insert(&self, next: &mut u64, transport: Arc<T>) -> NodeId {
        let node = NodeId(*next);
        *next += 1;
        transport.set_node_id(node);
        transport.register_event_handler(self.relay.clone());
        self.transports.insert(node, transport);
        node
    }

    fn transport(&self, node: NodeId) -> Option<Arc<T>> {
        self.transports.get(&node).map(|entry| entry.value().clone())
    }

    fn snapshot(&self) -> Vec<(NodeId, Arc<T>)> {
        self.transports
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn listener(&self) -> Option<Arc<T::Listener>> {
        lock(&self.listener).clone()
    }

    fn publish(&self, event: SessionEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn on_transport_event(&self, state: NetEventState) {
        let Some(node) = state.node else {
            debug!("dropping {:?} event from unregistered transport", state.kind);
            return;
        };

        match state.kind {
            NetEventType::Connect => match self.transport(node) {
                Some(transport) if state.result == NetEventResult::Success => {
                    info!("node {} connected ({})", node, T::KIND);
                    self.publish(SessionEvent::Connected {
                        node,
                        peer: transport.remote_endpoint(),
                    });
                }
                Some(_) => debug!("node {} reported a failed connect", node),
                None => warn!("connect event for unknown node {}, dropped", node),
            },
            NetEventType::Disconnect => match self.transports.remove(&node) {
                Some((_, transport)) => {
                    transport.unregister_event_handler(&self.relay);
                    info!("node {} disconnected ({})", node, T::KIND);
                    self.publish(SessionEvent::Disconnected { node });
                }
                None => warn!("disconnect event for unknown node {}, dropped", node),
            },
            kind @ (NetEventType::SendError | NetEventType::ReceiveError) => {
                if self.transports.contains_key(&node) {
                    self.publish(SessionEvent::TransportError { node, kind });
                } else {
                    warn!("{:?} for unknown node {}, dropped", kind, node);
                }
            }
        }
    }

    fn accept_clients(&self, listener: &T::Listener) {
        while let Some(socket) = listener.accept() {
            let transport = Arc::new(T::new(&self.config));
            if let Err(e) = transport.initialize(socket) {
                warn!("failed to adopt accepted {} socket: {}", T::KIND, e);
                continue;
            }
            let peer = transport.remote_endpoint();

            let limit = self.max_connections.load(Ordering::Relaxed);
            match self.admit(transport.clone(), limit) {
                Some(node) => {
                    info!("accepted node {} from {:?}", node, peer);
                    self.publish(SessionEvent::Connected { node, peer });
                }
                None => {
                    warn!(
                        "connection limit of {} reached, closing new {} peer {:?}",
                        limit,
                        T::KIND,
                        peer
                    );
                    transport.terminate();
                }
            }
        }
    }

    fn tick(&self) {
        let listener = self.listener();
        if let Some(listener) = &listener {
            self.accept_clients(listener);
        }

        for (_, transport) in self.snapshot() {
            transport.dispatch();
        }

        if let Some(listener) = &listener {
            listener.dispatch_receive(&self.snapshot());
        }
    }
}

async fn run_worker<T: Transport>(
    shared: Weak<SessionShared<T>>,
    mut stop: watch::Receiver<bool>,
    tick_interval: Duration,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }

        let Some(session) = shared.upgrade() else {
            break;
        };
        session.tick();
    }
    debug!("{} session worker stopped", T::KIND);
}

/// Registry of transports of one kind plus the worker driving them
pub struct Session<T: Transport> {
    shared: Arc<SessionShared<T>>,
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &T::KIND)
            .field("nodes", &self.shared.transports.len())
            .field("listen_addr", &self.listen_addr())
            .finish()
    }
}

impl<T: Transport> Session<T> {
    /// Create an idle session
    pub fn new(config: SessionConfig) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared<T>>| SessionShared {
            config,
            transports: DashMap::new(),
            next_node: Mutex::new(0),
            listener: Mutex::new(None),
            listen_addr: Mutex::new(None),
            worker: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            relay: Arc::new(SessionRelay {
                shared: weak.clone(),
            }),
            max_connections: AtomicUsize::new(0),
            is_server: AtomicBool::new(false),
        });
        Self { shared }
    }

    /// Configuration the session was created with
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Receive every lifecycle event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    fn ensure_worker(&self) {
        let mut worker = lock(&self.shared.worker);
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(
            Arc::downgrade(&self.shared),
            stop_rx,
            self.shared.config.tick_interval,
        ));
        *worker = Some(Worker { stop, handle });
        debug!("{} session worker started", T::KIND);
    }

    async fn stop_worker(&self) {
        let worker = lock(&self.shared.worker).take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            if let Err(e) = worker.handle.await {
                warn!("{} session worker ended abnormally: {}", T::KIND, e);
            }
        }
    }

    /// Bind the listening socket on `port` and start the worker
    ///
    /// Returns the bound address. Calling it again while listening returns
    /// the existing address.
    pub async fn start_server(
        &self,
        port: u16,
        max_connections: usize,
    ) -> Result<SocketAddr, SessionError> {
        if let Some(addr) = self.listen_addr() {
            self.ensure_worker();
            return Ok(addr);
        }

        let listener = <T::Listener as Listener<T>>::bind(port, &self.shared.config).await?;
        let addr = listener.local_addr().map_err(SessionError::Bind)?;

        *lock(&self.shared.listener) = Some(Arc::new(listener));
        *lock(&self.shared.listen_addr) = Some(addr);
        self.shared
            .max_connections
            .store(max_connections, Ordering::Relaxed);
        self.shared.is_server.store(true, Ordering::Relaxed);
        self.ensure_worker();

        info!("{} server listening on {}", T::KIND.to_uppercase(), addr);
        Ok(addr)
    }

    /// Stop the worker, waiting for it to exit, then close the listener
    ///
    /// Registered nodes stay in the registry but are no longer dispatched.
    pub async fn stop_server(&self) {
        self.stop_worker().await;
        let listener = lock(&self.shared.listener).take();
        let addr = lock(&self.shared.listen_addr).take();
        self.shared.is_server.store(false, Ordering::Relaxed);
        if listener.is_some() {
            info!("{} server on {:?} stopped", T::KIND.to_uppercase(), addr);
        }
    }

    /// Stop the server and disconnect every node
    pub async fn shutdown(&self) {
        self.stop_server().await;
        for node in self.nodes() {
            let _ = self.disconnect(node);
        }
    }

    /// Connect to a peer and register it under a fresh node
    ///
    /// On failure nothing is registered and a
    /// [`SessionEvent::ConnectFailed`] is published.
    pub async fn connect(&self, address: &str, port: u16) -> Result<NodeId, SessionError> {
        self.ensure_worker();

        let transport = Arc::new(T::new(&self.shared.config));
        if let Some(addr) = self.listen_addr() {
            transport.set_server_port(addr.port());
        }

        if let Err(e) = transport.connect(address, port).await {
            self.shared.publish(SessionEvent::ConnectFailed {
                target: format!("{address}:{port}"),
            });
            return Err(e);
        }

        let connected = transport.is_connected();
        let peer = transport.remote_endpoint();
        let node = self.shared.join(transport);
        info!("node {} joined, dialled {}:{} ({})", node, address, port, T::KIND);
        if connected {
            self.shared.publish(SessionEvent::Connected { node, peer });
        }
        Ok(node)
    }

    /// Disconnect a node and remove it from the registry
    ///
    /// Publishes exactly one [`SessionEvent::Disconnected`] when the node
    /// was live.
    pub fn disconnect(&self, node: NodeId) -> Result<(), SessionError> {
        let transport = self
            .shared
            .transport(node)
            .ok_or(SessionError::UnknownNode(node))?;

        transport.disconnect();
        if self.shared.transports.remove(&node).is_some() {
            transport.unregister_event_handler(&self.shared.relay);
            self.shared.publish(SessionEvent::Disconnected { node });
        }
        transport.terminate();
        Ok(())
    }

    /// Queue one message for a node
    pub fn send(&self, node: NodeId, data: &[u8]) -> Result<usize, SessionError> {
        self.shared
            .transport(node)
            .ok_or(SessionError::UnknownNode(node))?
            .send(data)
    }

    /// Take one received message from a node, returning 0 when none is pending
    pub fn receive(&self, node: NodeId, buffer: &mut [u8]) -> Result<usize, SessionError> {
        self.shared
            .transport(node)
            .ok_or(SessionError::UnknownNode(node))?
            .receive(buffer)
    }

    /// Number of registered nodes
    pub fn node_count(&self) -> usize {
        self.shared.transports.len()
    }

    /// Registered nodes in allocation order
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.shared.transports.iter().map(|e| *e.key()).collect();
        nodes.sort();
        nodes
    }

    /// Whether a node is registered
    pub fn contains(&self, node: NodeId) -> bool {
        self.shared.transports.contains_key(&node)
    }

    /// Whether a node's transport reports its peer reachable
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.shared
            .transport(node)
            .is_some_and(|transport| transport.is_connected())
    }

    /// Whether the listening socket is open
    pub fn is_server(&self) -> bool {
        self.shared.is_server.load(Ordering::Relaxed)
    }

    /// Whether the worker is running
    pub fn is_running(&self) -> bool {
        lock(&self.shared.worker)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Local socket address of a node's transport
    pub fn local_endpoint(&self, node: NodeId) -> Option<SocketAddr> {
        self.shared.transport(node)?.local_endpoint()
    }

    /// Peer socket address of a node's transport
    pub fn remote_endpoint(&self, node: NodeId) -> Option<SocketAddr> {
        self.shared.transport(node)?.remote_endpoint()
    }

    /// Bound address of the listening socket
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.listen_addr)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.shared.worker).take() {
            let _ = worker.stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_node_operations() {
        let session = TcpSession::new(SessionConfig::default());
        let mut buffer = [0u8; 8];

        assert!(matches!(
            session.send(NodeId(7), b"x"),
            Err(SessionError::UnknownNode(NodeId(7)))
        ));
        assert!(matches!(
            session.receive(NodeId(7), &mut buffer),
            Err(SessionError::UnknownNode(_))
        ));
        assert!(matches!(
            session.disconnect(NodeId(7)),
            Err(SessionError::UnknownNode(_))
        ));
        assert_eq!(session.node_count(), 0);
    }

    #[tokio::test]
    async fn test_node_ids_are_sequential() {
        let session = TcpSession::new(SessionConfig::default());
        let config = SessionConfig::default();
        let first = session.shared.join(Arc::new(TcpTransport::new(&config)));
        let second = session.shared.join(Arc::new(TcpTransport::new(&config)));
        assert_eq!(first, NodeId(0));
        assert_eq!(second, NodeId(1));
        assert_eq!(session.nodes(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_admit_respects_limit() {
        let session = TcpSession::new(SessionConfig::default());
        let config = SessionConfig::default();
        let first = session.shared.admit(Arc::new(TcpTransport::new(&config)), 1);
        let second = session.shared.admit(Arc::new(TcpTransport::new(&config)), 1);
        assert_eq!(first, Some(NodeId(0)));
        assert_eq!(second, None);
        assert_eq!(session.node_count(), 1);
    }

    #[tokio::test]
    async fn test_dialled_nodes_count_toward_limit() {
        let server = TcpSession::new(SessionConfig::default());
        let addr = server.start_server(0, 1).await.unwrap();

        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        server.connect("127.0.0.1", upstream_port).await.unwrap();
        assert_eq!(server.node_count(), 1);

        let mut refused = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
            .await
            .unwrap();
        let mut buffer = [0u8; 8];
        let n = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read(&mut refused, &mut buffer),
        )
        .await
        .unwrap()
        .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.node_count(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_server() {
        let session = TcpSession::new(SessionConfig::default());
        assert!(!session.is_running());

        let addr = session.start_server(0, 4).await.unwrap();
        assert!(session.is_server());
        assert!(session.is_running());
        assert_eq!(session.start_server(0, 4).await.unwrap(), addr);

        session.stop_server().await;
        assert!(!session.is_server());
        assert!(!session.is_running());
        assert!(session.listen_addr().is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_registers_nothing() {
        let session = TcpSession::new(SessionConfig::default());
        let mut events = session.subscribe();

        let result = session.connect("bogus", 1).await;
        assert!(matches!(result, Err(SessionError::InvalidAddress(_))));
        assert_eq!(session.node_count(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ConnectFailed {
                target: "bogus:1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_events_for_unknown_nodes_are_dropped() {
        let session = UdpSession::new(SessionConfig::default());
        let mut events = session.subscribe();

        session.shared.on_transport_event(NetEventState {
            node: Some(NodeId(3)),
            kind: NetEventType::Disconnect,
            result: NetEventResult::Success,
        });
        session.shared.on_transport_event(NetEventState {
            node: None,
            kind: NetEventType::Connect,
            result: NetEventResult::Success,
        });
        assert!(events.try_recv().is_err());
    }
}
