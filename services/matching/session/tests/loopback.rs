//! Loopback scenarios exercising sessions over real sockets.

use matchnet_session::{
    NodeId, PacketRouter, SessionConfig, SessionEvent, TcpSession, UdpSession,
};
use matchnet_wire::PacketId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event channel closed")
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_udp_config() -> SessionConfig {
    SessionConfig {
        keepalive_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_ping_reaches_server_handler() {
    let server = TcpSession::new(SessionConfig::default());
    let mut server_events = server.subscribe();
    let addr = server.start_server(0, 8).await.unwrap();

    let client = TcpSession::new(SessionConfig::default());
    let client_node = client.connect("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(client_node, NodeId(0));
    assert!(client.is_connected(client_node));

    let server_node = match next_event(&mut server_events).await {
        SessionEvent::Connected { node, peer } => {
            assert_eq!(peer, client.local_endpoint(client_node));
            node
        }
        other => panic!("unexpected event {:?}", other),
    };

    let router = PacketRouter::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        router.register(PacketId::GameSyncInfo, move |node, payload| {
            received.lock().unwrap().push((node, payload.to_vec()));
        });
    }

    PacketRouter::send_frame(&client, client_node, PacketId::GameSyncInfo, b"ping").unwrap();

    timeout(WAIT, async {
        while router.poll(&server) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let received = received.lock().unwrap();
    assert_eq!(*received, vec![(server_node, b"ping".to_vec())]);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connects_get_distinct_nodes() {
    const CLIENTS: usize = 8;

    let server = TcpSession::new(SessionConfig::default());
    let addr = server.start_server(0, CLIENTS).await.unwrap();

    let client = TcpSession::new(SessionConfig::default());
    let results = futures::future::join_all(
        (0..CLIENTS).map(|_| client.connect("127.0.0.1", addr.port())),
    )
    .await;

    let nodes: HashSet<NodeId> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(nodes.len(), CLIENTS);
    assert_eq!(client.node_count(), CLIENTS);
    assert_eq!(client.nodes().len(), CLIENTS);

    wait_for(|| server.node_count() == CLIENTS).await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_disconnect_publishes_once() {
    let server = TcpSession::new(SessionConfig::default());
    let mut server_events = server.subscribe();
    let addr = server.start_server(0, 8).await.unwrap();

    let client = TcpSession::new(SessionConfig::default());
    let mut client_events = client.subscribe();
    let node = client.connect("127.0.0.1", addr.port()).await.unwrap();
    assert!(matches!(
        next_event(&mut client_events).await,
        SessionEvent::Connected { .. }
    ));
    assert!(matches!(
        next_event(&mut server_events).await,
        SessionEvent::Connected { .. }
    ));

    client.disconnect(node).unwrap();
    assert_eq!(
        next_event(&mut client_events).await,
        SessionEvent::Disconnected { node }
    );
    assert_eq!(client.node_count(), 0);
    assert!(client.disconnect(node).is_err());

    // the server notices the orderly close on its side
    assert!(matches!(
        next_event(&mut server_events).await,
        SessionEvent::Disconnected { .. }
    ));
    assert_eq!(server.node_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client_events.try_recv().is_err());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_limit_closes_extra_peers() {
    let server = TcpSession::new(SessionConfig::default());
    let addr = server.start_server(0, 1).await.unwrap();

    let client = TcpSession::new(SessionConfig::default());
    let mut client_events = client.subscribe();
    let first = client.connect("127.0.0.1", addr.port()).await.unwrap();
    wait_for(|| server.node_count() == 1).await;

    let second = client.connect("127.0.0.1", addr.port()).await.unwrap();
    assert_ne!(first, second);

    // the refused peer sees the server close its stream
    loop {
        if let SessionEvent::Disconnected { node } = next_event(&mut client_events).await {
            assert_eq!(node, second);
            break;
        }
    }
    assert_eq!(server.node_count(), 1);
    assert!(client.contains(first));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_peers_handshake_and_exchange_frames() {
    let alice = UdpSession::new(fast_udp_config());
    let bob = UdpSession::new(fast_udp_config());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let alice_addr = alice.start_server(0, 4).await.unwrap();
    let bob_addr = bob.start_server(0, 4).await.unwrap();

    let alice_node = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let bob_node = bob.connect("127.0.0.1", alice_addr.port()).await.unwrap();
    assert!(!alice.is_connected(alice_node));

    match next_event(&mut alice_events).await {
        SessionEvent::Connected { node, peer } => {
            assert_eq!(node, alice_node);
            let bob_port = bob.local_endpoint(bob_node).map(|a| a.port());
            assert_eq!(peer.map(|a| a.port()), bob_port);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        next_event(&mut bob_events).await,
        SessionEvent::Connected { node, .. } if node == bob_node
    ));

    let router = PacketRouter::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        router.register(PacketId::ChatMessage, move |node, payload| {
            received.lock().unwrap().push((node, payload.to_vec()));
        });
    }

    PacketRouter::send_frame(&alice, alice_node, PacketId::ChatMessage, b"ping").unwrap();
    timeout(WAIT, async {
        while router.poll(&bob) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *received.lock().unwrap(),
        vec![(bob_node, b"ping".to_vec())]
    );

    // further keepalives do not report the peer again
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice_events.try_recv().is_err());
    assert!(bob_events.try_recv().is_err());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_keepalive_from_unknown_peer_is_ignored() {
    let session = UdpSession::new(fast_udp_config());
    let mut events = session.subscribe();
    let addr = session.start_server(0, 4).await.unwrap();

    // a node dialling a listener that never answers
    let node = session.connect("127.0.0.1", 9).await.unwrap();

    let stranger = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger
        .send_to(b"127.0.0.1:1:KeepAlive.", ("127.0.0.1", addr.port()))
        .await
        .unwrap();
    stranger
        .send_to(b"\0\0\0\x15hello", ("127.0.0.1", addr.port()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!session.is_connected(node));
    assert!(events.try_recv().is_err());

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_silent_peer_is_removed_from_session() {
    let config = SessionConfig {
        keepalive_interval: Duration::from_millis(50),
        keepalive_timeout: Duration::from_millis(400),
        ..SessionConfig::default()
    };
    let alice = UdpSession::new(config.clone());
    let bob = UdpSession::new(config);
    let mut alice_events = alice.subscribe();

    let alice_addr = alice.start_server(0, 4).await.unwrap();
    let bob_addr = bob.start_server(0, 4).await.unwrap();
    let alice_node = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    bob.connect("127.0.0.1", alice_addr.port()).await.unwrap();

    assert_eq!(
        next_event(&mut alice_events).await,
        SessionEvent::Connected {
            node: alice_node,
            peer: alice.remote_endpoint(alice_node),
        }
    );

    // bob's worker stops, so its keepalives stop too
    bob.stop_server().await;

    assert_eq!(
        next_event(&mut alice_events).await,
        SessionEvent::Disconnected { node: alice_node }
    );
    assert_eq!(alice.node_count(), 0);
    assert!(!alice.contains(alice_node));

    alice.shutdown().await;
    bob.shutdown().await;
}
