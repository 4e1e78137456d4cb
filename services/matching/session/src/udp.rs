//! UDP transport with keepalive handshake, and the shared receiving socket.
//!
//! A [`UdpTransport`] sends from its own ephemeral socket. After `connect`
//! it periodically sends a keepalive to the peer's listener announcing this
//! side's IP and listening port. The peer's [`UdpReceiver`] matches the
//! keepalive to the transport that connected back, which then learns the
//! sender's socket address, reports `Connect` once and sends data there.
//! A connected transport that hears no keepalive for the configured timeout
//! disconnects itself.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::{
    EventHandlers, NetEventResult, NetEventState, NetEventType, TransportEventHandler,
};
use crate::keepalive::{build_keepalive, is_keepalive, parse_keepalive};
use crate::lock;
use crate::matcher::{EndpointMatcher, PeerView};
use crate::queue::PacketQueue;
use crate::transport::{node_label, parse_peer, Listener, NodeId, Transport};
use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Datagrams read from one socket per dispatch pass
const MAX_DATAGRAMS_PER_PASS: usize = 256;

/// Largest UDP payload; reads use a buffer this size so nothing is cut short
const MAX_DATAGRAM_SIZE: usize = 65_536;

#[derive(Debug)]
struct UdpState {
    socket: Option<Arc<UdpSocket>>,
    target: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    announce_ip: Option<IpAddr>,
    server_port: u16,
    requested: bool,
    connected: bool,
    last_seen: Instant,
    last_keepalive: Option<Instant>,
}

impl UdpState {
    fn close(&mut self) -> bool {
        self.requested = false;
        self.connected = false;
        self.socket.take().is_some()
    }
}

/// Datagram transport for one UDP peer
#[derive(Debug)]
pub struct UdpTransport {
    node: Mutex<Option<NodeId>>,
    state: Mutex<UdpState>,
    send_queue: PacketQueue,
    recv_queue: PacketQueue,
    handlers: EventHandlers,
    mtu: usize,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

impl UdpTransport {
    /// Peer listening endpoint this transport was connected to
    pub fn target(&self) -> Option<SocketAddr> {
        lock(&self.state).target
    }

    /// Hand an inbound datagram to the transport
    ///
    /// A keepalive marks the peer alive and records `source` as its socket;
    /// the first one fires `Connect`. Anything else is queued for
    /// [`Transport::receive`].
    pub fn set_receive_data(&self, data: &[u8], source: SocketAddr) {
        if is_keepalive(data) {
            let first = {
                let mut state = lock(&self.state);
                if state.socket.is_none() {
                    return;
                }
                let first = !state.connected;
                state.connected = true;
                state.remote = Some(source);
                state.last_seen = Instant::now();
                first
            };
            if first {
                info!(
                    "node {} UDP peer {} completed keepalive handshake",
                    node_label(self.node_id()),
                    source
                );
                self.fire(NetEventType::Connect, NetEventResult::Success);
            }
        } else if !data.is_empty() {
            debug!(
                "node {} udp receive of {} bytes from {}",
                node_label(self.node_id()),
                data.len(),
                source
            );
            if let Err(e) = self.recv_queue.enqueue(data) {
                warn!(
                    "node {} dropping datagram from {}: {}",
                    node_label(self.node_id()),
                    source,
                    e
                );
            }
        }
    }

    fn fire(&self, kind: NetEventType, result: NetEventResult) {
        self.handlers.notify(NetEventState {
            node: self.node_id(),
            kind,
            result,
        });
    }

    fn dispatch_send(&self, state: &UdpState, socket: &UdpSocket) -> io::Result<()> {
        let Some(destination) = state.remote.or(state.target) else {
            return Ok(());
        };

        while let Some(message) = self.send_queue.pop() {
            match socket.try_send_to(&message, destination) {
                Ok(_) => {
                    debug!(
                        "node {} udp send of {} bytes to {}",
                        node_label(self.node_id()),
                        message.len(),
                        destination
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.send_queue.push_front(message);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn drain_socket(&self, socket: &UdpSocket) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut datagrams = Vec::new();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        for _ in 0..MAX_DATAGRAMS_PER_PASS {
            match socket.try_recv_from(&mut buffer) {
                Ok((n, source)) if n > self.mtu => {
                    warn!(
                        "node {} dropping {} byte datagram from {}, larger than MTU {}",
                        node_label(self.node_id()),
                        n,
                        source,
                        self.mtu
                    );
                }
                Ok((n, source)) => datagrams.push((buffer[..n].to_vec(), source)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("node {} udp read failed: {}", node_label(self.node_id()), e);
                    break;
                }
            }
        }
        datagrams
    }

    fn send_keepalive(&self, state: &mut UdpState, socket: &UdpSocket, now: Instant) {
        let Some(target) = state.target else {
            return;
        };
        let due = state
            .last_keepalive
            .map_or(true, |sent| now.duration_since(sent) >= self.keepalive_interval);
        if !due {
            return;
        }

        let ip = state.announce_ip.unwrap_or(target.ip());
        let datagram = build_keepalive(ip, state.server_port);
        match socket.try_send_to(&datagram, target) {
            Ok(_) => {
                debug!("node {} keepalive to {}", node_label(self.node_id()), target);
                state.last_keepalive = Some(now);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(
                    "node {} keepalive to {} failed: {}",
                    node_label(self.node_id()),
                    target,
                    e
                );
                state.last_keepalive = Some(now);
            }
        }
    }
}

/// Local address used to reach `target`, as the kernel routes it
async fn route_local_ip(target: SocketAddr) -> io::Result<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    probe.connect(target).await?;
    Ok(probe.local_addr()?.ip())
}

#[async_trait]
impl Transport for UdpTransport {
    type Socket = UdpSocket;
    type Listener = UdpReceiver;

    const KIND: &'static str = "udp";

    fn new(config: &SessionConfig) -> Self {
        Self {
            node: Mutex::new(None),
            state: Mutex::new(UdpState {
                socket: None,
                target: None,
                remote: None,
                announce_ip: None,
                server_port: 0,
                requested: false,
                connected: false,
                last_seen: Instant::now(),
                last_keepalive: None,
            }),
            send_queue: PacketQueue::new(config.mtu),
            recv_queue: PacketQueue::new(config.mtu),
            handlers: EventHandlers::new(),
            mtu: config.mtu,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
        }
    }

    fn initialize(&self, socket: UdpSocket) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        state.socket = Some(Arc::new(socket));
        state.requested = true;
        state.last_seen = Instant::now();
        Ok(())
    }

    fn terminate(&self) {
        lock(&self.state).close();
        self.send_queue.clear();
        self.recv_queue.clear();
    }

    fn node_id(&self) -> Option<NodeId> {
        *lock(&self.node)
    }

    fn set_node_id(&self, node: NodeId) {
        *lock(&self.node) = Some(node);
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        let state = lock(&self.state);
        state.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        lock(&self.state).remote
    }

    fn set_server_port(&self, port: u16) {
        lock(&self.state).server_port = port;
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn connect(&self, address: &str, port: u16) -> Result<(), SessionError> {
        let target = match parse_peer(address, port) {
            Ok(target) => target,
            Err(e) => {
                self.fire(NetEventType::Connect, NetEventResult::Failure);
                return Err(e);
            }
        };

        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("UDP socket bind failed: {}", e);
                self.fire(NetEventType::Connect, NetEventResult::Failure);
                return Err(SessionError::Bind(e));
            }
        };
        let announce_ip = route_local_ip(target).await.ok();

        {
            let mut state = lock(&self.state);
            state.socket = Some(Arc::new(socket));
            state.target = Some(target);
            state.remote = None;
            state.announce_ip = announce_ip;
            state.requested = true;
            state.connected = false;
            state.last_seen = Instant::now();
            state.last_keepalive = None;
        }
        info!("UDP transport targeting {} (announcing {:?})", target, announce_ip);
        Ok(())
    }

    fn disconnect(&self) {
        let was_open = lock(&self.state).close();
        if was_open {
            info!("node {} UDP disconnected", node_label(self.node_id()));
            self.fire(NetEventType::Disconnect, NetEventResult::Success);
        }
    }

    fn send(&self, data: &[u8]) -> Result<usize, SessionError> {
        if lock(&self.state).socket.is_none() {
            return Err(SessionError::NotConnected);
        }
        Ok(self.send_queue.enqueue(data)?)
    }

    fn receive(&self, buffer: &mut [u8]) -> Result<usize, SessionError> {
        Ok(self.recv_queue.dequeue(buffer)?)
    }

    fn dispatch(&self) {
        let mut events = Vec::new();
        let received = {
            let mut state = lock(&self.state);
            let Some(socket) = state.socket.clone() else {
                return;
            };

            if let Err(e) = self.dispatch_send(&state, &socket) {
                debug!("node {} udp write failed: {}", node_label(self.node_id()), e);
                events.push((NetEventType::SendError, NetEventResult::Failure));
            }
            let received = self.drain_socket(&socket);

            let now = Instant::now();
            let silent = now.duration_since(state.last_seen);
            if state.requested && state.connected && silent > self.keepalive_timeout {
                info!(
                    "node {} UDP peer silent for {:?}, disconnecting",
                    node_label(self.node_id()),
                    silent
                );
                state.close();
                events.push((NetEventType::Disconnect, NetEventResult::Success));
                Vec::new()
            } else {
                self.send_keepalive(&mut state, &socket, now);
                received
            }
        };

        for (data, source) in received {
            self.set_receive_data(&data, source);
        }
        for (kind, result) in events {
            self.fire(kind, result);
        }
    }

    fn register_event_handler(&self, handler: Arc<dyn TransportEventHandler>) {
        self.handlers.register(handler);
    }

    fn unregister_event_handler(&self, handler: &Arc<dyn TransportEventHandler>) {
        self.handlers.unregister(handler);
    }
}

/// Session-wide UDP socket demultiplexing datagrams to transports
#[derive(Debug)]
pub struct UdpReceiver {
    socket: UdpSocket,
    mtu: usize,
    matcher: Arc<dyn EndpointMatcher>,
}

impl UdpReceiver {
    fn resolve(&self, data: &[u8], source: SocketAddr, peers: &[PeerView]) -> Option<NodeId> {
        if is_keepalive(data) {
            self.matcher.match_keepalive(parse_keepalive(data), source, peers)
        } else {
            self.matcher.match_datagram(source, peers)
        }
    }
}

#[async_trait]
impl Listener<UdpTransport> for UdpReceiver {
    async fn bind(port: u16, config: &SessionConfig) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(SessionError::Bind)?;
        Ok(Self {
            socket,
            mtu: config.mtu,
            matcher: config.endpoint_matcher.clone(),
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn accept(&self) -> Option<UdpSocket> {
        None
    }

    fn dispatch_receive(&self, transports: &[(NodeId, Arc<UdpTransport>)]) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        for _ in 0..MAX_DATAGRAMS_PER_PASS {
            let (n, source) = match self.socket.try_recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("udp listener read failed: {}", e);
                    return;
                }
            };
            if n > self.mtu {
                warn!(
                    "dropping {} byte datagram from {}, larger than MTU {}",
                    n,
                    source,
                    self.mtu
                );
                continue;
            }
            let data = &buffer[..n];

            let peers: Vec<PeerView> = transports
                .iter()
                .map(|(node, transport)| PeerView {
                    node: *node,
                    target: transport.target(),
                    remote: transport.remote_endpoint(),
                })
                .collect();

            match self.resolve(data, source, &peers) {
                Some(node) => {
                    if let Some((_, transport)) = transports.iter().find(|(n, _)| *n == node) {
                        transport.set_receive_data(data, source);
                    }
                }
                None => debug!("no node for {} byte datagram from {}", n, source),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::Recorder;

    async fn targeted_transport(
        config: &SessionConfig,
    ) -> (UdpTransport, Arc<Recorder>, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let transport = UdpTransport::new(config);
        let recorder = Arc::new(Recorder::default());
        transport.register_event_handler(recorder.clone());
        transport.connect("127.0.0.1", port).await.unwrap();
        (transport, recorder, peer)
    }

    #[tokio::test]
    async fn test_connect_waits_for_keepalive() {
        let (transport, recorder, peer) = targeted_transport(&SessionConfig::default()).await;
        let source = peer.local_addr().unwrap();

        assert!(!transport.is_connected());
        assert_eq!(recorder.count(NetEventType::Connect), 0);

        transport.set_receive_data(b"\0\0\0\x05ping", source);
        assert!(!transport.is_connected());

        transport.set_receive_data(b"127.0.0.1:9000:KeepAlive.", source);
        transport.set_receive_data(b"127.0.0.1:9000:KeepAlive.", source);
        assert!(transport.is_connected());
        assert_eq!(transport.remote_endpoint(), Some(source));
        assert_eq!(recorder.count(NetEventType::Connect), 1);

        let mut buffer = [0u8; 32];
        let n = transport.receive(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"\0\0\0\x05ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (transport, recorder, peer) = targeted_transport(&SessionConfig::default()).await;
        transport.set_receive_data(b"127.0.0.1:1:KeepAlive.", peer.local_addr().unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        transport.dispatch();
        assert!(transport.is_connected());

        tokio::time::advance(Duration::from_secs(2)).await;
        transport.dispatch();
        assert!(!transport.is_connected());
        assert_eq!(recorder.count(NetEventType::Disconnect), 1);

        transport.dispatch();
        transport.disconnect();
        assert_eq!(recorder.count(NetEventType::Disconnect), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_refreshes_liveness() {
        let (transport, recorder, peer) = targeted_transport(&SessionConfig::default()).await;
        let source = peer.local_addr().unwrap();
        transport.set_receive_data(b"127.0.0.1:1:KeepAlive.", source);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(6)).await;
            transport.set_receive_data(b"127.0.0.1:1:KeepAlive.", source);
            transport.dispatch();
        }
        assert!(transport.is_connected());
        assert_eq!(recorder.count(NetEventType::Disconnect), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconnected_transport_never_times_out() {
        let (transport, recorder, _peer) = targeted_transport(&SessionConfig::default()).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        transport.dispatch();
        assert_eq!(recorder.count(NetEventType::Disconnect), 0);
        assert!(transport.target().is_some());
    }

    #[tokio::test]
    async fn test_invalid_address_fires_failure() {
        let transport = UdpTransport::new(&SessionConfig::default());
        let recorder = Arc::new(Recorder::default());
        transport.register_event_handler(recorder.clone());

        let result = transport.connect("999.1.1.1", 5000).await;
        assert!(matches!(result, Err(SessionError::InvalidAddress(_))));
        assert_eq!(lock(&recorder.events)[0].result, NetEventResult::Failure);
    }

    /// Dispatch until a message is queued, returning it
    async fn next_message<F: Fn()>(transport: &UdpTransport, dispatch: F) -> Vec<u8> {
        let mut buffer = vec![0u8; 2048];
        let wait = async {
            loop {
                dispatch();
                let n = transport.receive(&mut buffer).unwrap();
                if n > 0 {
                    return buffer[..n].to_vec();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_dropped() {
        let (transport, _recorder, peer) = targeted_transport(&SessionConfig::default()).await;
        let port = transport.local_endpoint().unwrap().port();

        peer.send_to(&vec![7u8; 2000], ("127.0.0.1", port)).await.unwrap();
        peer.send_to(b"\0\0\0\x05ping", ("127.0.0.1", port)).await.unwrap();

        let message = next_message(&transport, || transport.dispatch()).await;
        assert_eq!(message, b"\0\0\0\x05ping");

        let mut buffer = vec![0u8; 2048];
        assert_eq!(transport.receive(&mut buffer).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_listener_drops_oversized_datagram() {
        let config = SessionConfig::default();
        let receiver = UdpReceiver::bind(0, &config).await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let (transport, _recorder, _peer) = targeted_transport(&config).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        transport.set_receive_data(b"127.0.0.1:1:KeepAlive.", sender.local_addr().unwrap());
        let transports = vec![(NodeId(0), Arc::new(transport))];

        sender.send_to(&vec![7u8; 2000], ("127.0.0.1", port)).await.unwrap();
        sender.send_to(b"\0\0\0\x05ping", ("127.0.0.1", port)).await.unwrap();

        let transport = &transports[0].1;
        let message = next_message(transport, || receiver.dispatch_receive(&transports)).await;
        assert_eq!(message, b"\0\0\0\x05ping");

        let mut buffer = vec![0u8; 2048];
        assert_eq!(transport.receive(&mut buffer).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_sent_to_target() {
        let (transport, _recorder, peer) = targeted_transport(&SessionConfig::default()).await;
        transport.set_server_port(4321);

        let mut buffer = [0u8; 64];
        let received = async {
            loop {
                transport.dispatch();
                if let Ok(Ok((n, _))) = tokio::time::timeout(
                    Duration::from_millis(20),
                    peer.recv_from(&mut buffer),
                )
                .await
                {
                    return n;
                }
            }
        };
        let n = tokio::time::timeout(Duration::from_secs(5), received).await.unwrap();
        assert_eq!(&buffer[..n], b"127.0.0.1:4321:KeepAlive.");
    }
}
