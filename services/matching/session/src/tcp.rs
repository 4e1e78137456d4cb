//! TCP transport and acceptor.
//!
//! Each `dispatch` pass writes queued messages in MTU-sized chunks while the
//! socket accepts them, then reads MTU-sized chunks until the socket would
//! block. Every read becomes one receive-queue item: TCP does not preserve
//! message boundaries, so peers are expected to send one small packet at a
//! time.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::{
    EventHandlers, NetEventResult, NetEventState, NetEventType, TransportEventHandler,
};
use crate::lock;
use crate::queue::PacketQueue;
use crate::transport::{node_label, parse_peer, Listener, NodeId, Transport};
use async_trait::async_trait;
use futures::FutureExt;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct TcpState {
    stream: Option<TcpStream>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

/// Outcome of draining the socket
enum ReadOutcome {
    Open,
    Closed,
}

/// Stream transport for one TCP peer
#[derive(Debug)]
pub struct TcpTransport {
    node: Mutex<Option<NodeId>>,
    state: Mutex<TcpState>,
    send_queue: PacketQueue,
    recv_queue: PacketQueue,
    handlers: EventHandlers,
    mtu: usize,
}

impl TcpTransport {
    fn fire(&self, kind: NetEventType, result: NetEventResult) {
        self.handlers.notify(NetEventState {
            node: self.node_id(),
            kind,
            result,
        });
    }

    /// Write queued messages until the queue empties or the socket is full
    fn dispatch_send(&self, stream: &TcpStream) -> io::Result<()> {
        while let Some(message) = self.send_queue.pop() {
            let mut written = 0;
            while written < message.len() {
                let end = (written + self.mtu).min(message.len());
                match stream.try_write(&message[written..end]) {
                    Ok(n) => written += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        self.send_queue.push_front(message.slice(written..));
                        return Ok(());
                    }
                    Err(e) => {
                        self.send_queue.push_front(message.slice(written..));
                        return Err(e);
                    }
                }
            }
            debug!("node {} tcp send of {} bytes", node_label(self.node_id()), message.len());
        }
        Ok(())
    }

    /// Read until the socket would block
    fn dispatch_receive(&self, stream: &TcpStream) -> io::Result<ReadOutcome> {
        let mut buffer = vec![0u8; self.mtu];
        loop {
            match stream.try_read(&mut buffer) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    debug!("node {} tcp receive of {} bytes", node_label(self.node_id()), n);
                    if let Err(e) = self.recv_queue.enqueue(&buffer[..n]) {
                        warn!("node {} dropping received chunk: {}", node_label(self.node_id()), e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) => return Err(e),
            }
        }
    }

    fn close(state: &mut TcpState) -> bool {
        state.stream.take().is_some()
    }
}

/// Errors meaning the peer is gone rather than a transient socket condition
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

#[async_trait]
impl Transport for TcpTransport {
    type Socket = TcpStream;
    type Listener = TcpAcceptor;

    const KIND: &'static str = "tcp";

    fn new(config: &SessionConfig) -> Self {
        Self {
            node: Mutex::new(None),
            state: Mutex::new(TcpState::default()),
            send_queue: PacketQueue::new(config.mtu),
            recv_queue: PacketQueue::new(config.mtu),
            handlers: EventHandlers::new(),
            mtu: config.mtu,
        }
    }

    fn initialize(&self, socket: TcpStream) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        state.local = socket.local_addr().ok();
        state.remote = socket.peer_addr().ok();
        state.stream = Some(socket);
        Ok(())
    }

    fn terminate(&self) {
        Self::close(&mut lock(&self.state));
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
        lock(&self.state).local
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        lock(&self.state).remote
    }

    // peers are told apart by their own socket, the listener port is not announced
    fn set_server_port(&self, _port: u16) {}

    fn is_connected(&self) -> bool {
        lock(&self.state).stream.is_some()
    }

    async fn connect(&self, address: &str, port: u16) -> Result<(), SessionError> {
        let addr = match parse_peer(address, port) {
            Ok(addr) => addr,
            Err(e) => {
                self.fire(NetEventType::Connect, NetEventResult::Failure);
                return Err(e);
            }
        };

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                self.initialize(stream)?;
                info!("TCP connected to {}", addr);
                self.fire(NetEventType::Connect, NetEventResult::Success);
                Ok(())
            }
            Err(source) => {
                warn!("TCP connect to {} failed: {}", addr, source);
                self.fire(NetEventType::Connect, NetEventResult::Failure);
                Err(SessionError::Connect { addr, source })
            }
        }
    }

    fn disconnect(&self) {
        let was_open = Self::close(&mut lock(&self.state));
        if was_open {
            info!("node {} TCP disconnected", node_label(self.node_id()));
            self.fire(NetEventType::Disconnect, NetEventResult::Success);
        }
    }

    fn send(&self, data: &[u8]) -> Result<usize, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        Ok(self.send_queue.enqueue(data)?)
    }

    fn receive(&self, buffer: &mut [u8]) -> Result<usize, SessionError> {
        Ok(self.recv_queue.dequeue(buffer)?)
    }

    fn dispatch(&self) {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            let Some(stream) = state.stream.as_ref() else {
                return;
            };

            let mut peer_gone = false;
            if let Err(e) = self.dispatch_send(stream) {
                debug!("node {} tcp write failed: {}", node_label(self.node_id()), e);
                peer_gone |= is_peer_gone(&e);
                events.push(NetEventType::SendError);
            }

            match self.dispatch_receive(stream) {
                Ok(ReadOutcome::Open) => {}
                Ok(ReadOutcome::Closed) => {
                    info!("node {} TCP peer closed the connection", node_label(self.node_id()));
                    peer_gone = true;
                }
                Err(e) => {
                    debug!("node {} tcp read failed: {}", node_label(self.node_id()), e);
                    peer_gone |= is_peer_gone(&e);
                    events.push(NetEventType::ReceiveError);
                }
            }

            if peer_gone && Self::close(&mut state) {
                events.push(NetEventType::Disconnect);
            }
        }

        for kind in events {
            let result = match kind {
                NetEventType::Disconnect => NetEventResult::Success,
                _ => NetEventResult::Failure,
            };
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

/// Listening socket handing accepted streams to new [`TcpTransport`]s
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener<TcpTransport> for TcpAcceptor {
    async fn bind(port: u16, _config: &SessionConfig) -> Result<Self, SessionError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(SessionError::Bind)?;
        Ok(Self { listener })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&self) -> Option<TcpStream> {
        match self.listener.accept().now_or_never()? {
            Ok((stream, peer)) => {
                debug!("accepted TCP connection from {}", peer);
                stream.set_nodelay(true).ok();
                Some(stream)
            }
            Err(e) => {
                debug!("TCP accept failed: {}", e);
                None
            }
        }
    }

    fn dispatch_receive(&self, _transports: &[(NodeId, Arc<TcpTransport>)]) {}
}
