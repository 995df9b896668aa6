//! End-to-end setup of two peers over loopback: STUN discovery against an
//! in-test responder, in-memory rendezvous, punching, relay fallback and
//! the session handshake.

use bytes::Bytes;
use meshlink::mesh::{NetworkKey, SessionConfig, SessionState};
use meshlink::nat_traversal::stun::{
    StunClass, StunMessage, ATTR_DATA, ATTR_ERROR_CODE, ATTR_MESSAGE_INTEGRITY, ATTR_NONCE, ATTR_REALM, ATTR_XOR_MAPPED_ADDRESS,
    ATTR_XOR_PEER_ADDRESS, ATTR_XOR_RELAYED_ADDRESS, METHOD_ALLOCATE, METHOD_DATA, METHOD_SEND,
};
use meshlink::nat_traversal::{
    virtual_ip, ConnectError, ConnectionState, MemoryTransport, NatTraversal, NatTraversalConfig, NatType, PathKind,
    PunchConfig, PunchOutlook, StunConfig, TurnConfig,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_test::{assert_err, assert_ok};

/// Answers binding requests with the sender's address, its port shifted
/// by `port_offset` to fake a translating NAT
async fn stun_responder(port_offset: u16) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(req) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            if req.class != StunClass::Request {
                continue;
            }
            let mapped = SocketAddr::new(from.ip(), from.port().wrapping_add(port_offset));
            let resp = StunMessage::binding_success(req.transaction_id, mapped);
            let _ = socket.send_to(&resp.encode(), from).await;
        }
    });

    addr
}

/// Just enough TURN to relay between two allocations on this server
async fn turn_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut by_client: HashMap<SocketAddr, SocketAddr> = HashMap::new();
        let mut by_relayed: HashMap<SocketAddr, SocketAddr> = HashMap::new();
        let mut next_port = 49152u16;
        let mut buf = [0u8; 4096];

        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(msg) = StunMessage::decode(&buf[..len]) else {
                continue;
            };

            if msg.class == StunClass::Indication && msg.method == METHOD_SEND {
                let (Some(peer), Some(data), Some(&own)) = (
                    msg.xor_address(ATTR_XOR_PEER_ADDRESS),
                    msg.attribute(ATTR_DATA),
                    by_client.get(&from),
                ) else {
                    continue;
                };
                let Some(&target) = by_relayed.get(&peer) else {
                    continue;
                };
                let mut out = StunMessage::new(METHOD_DATA, StunClass::Indication, rand::random());
                out.push_xor_address(ATTR_XOR_PEER_ADDRESS, own);
                out.push(ATTR_DATA, data.to_vec());
                let _ = socket.send_to(&out.encode(), target).await;
                continue;
            }

            let resp = if msg.attribute(ATTR_MESSAGE_INTEGRITY).is_none() {
                let mut r = StunMessage::new(msg.method, StunClass::Error, msg.transaction_id);
                r.push(ATTR_ERROR_CODE, vec![0, 0, 4, 1]);
                r.push(ATTR_REALM, b"loopback".to_vec());
                r.push(ATTR_NONCE, b"abc".to_vec());
                r
            } else {
                let mut r = StunMessage::new(msg.method, StunClass::Success, msg.transaction_id);
                if msg.method == METHOD_ALLOCATE {
                    let relayed = *by_client.entry(from).or_insert_with(|| {
                        next_port += 1;
                        SocketAddr::from(([127, 0, 0, 1], next_port))
                    });
                    by_relayed.insert(relayed, from);
                    r.push_xor_address(ATTR_XOR_RELAYED_ADDRESS, relayed);
                    r.push_xor_address(ATTR_XOR_MAPPED_ADDRESS, from);
                }
                r
            };
            let _ = socket.send_to(&resp.encode(), from).await;
        }
    });

    addr
}

fn config(peer_id: &str, stun_servers: Vec<SocketAddr>) -> NatTraversalConfig {
    NatTraversalConfig {
        network: "loopback-net".into(),
        local_peer_id: peer_id.into(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        stun_servers,
        stun: StunConfig {
            attempts: 2,
            initial_timeout: Duration::from_millis(200),
        },
        rendezvous_timeout: Duration::from_secs(5),
        rendezvous_retransmit: Duration::from_millis(200),
        punch: PunchConfig {
            interval: Duration::from_millis(30),
            attempts: 20,
            linger: 3,
        },
        session: SessionConfig {
            keepalive_interval: Duration::from_millis(500),
            degraded_after: Duration::from_secs(2),
            close_after: Duration::from_secs(5),
            hello_interval: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(3),
            ..SessionConfig::default()
        },
        relay: None,
    }
}

#[tokio::test]
async fn two_peers_connect_directly() {
    let stun = stun_responder(0).await;
    let key = NetworkKey::from_bytes([42; 32]);
    let (ta, tb) = MemoryTransport::pair();

    let mut alice = NatTraversal::new(config("alice", vec![stun]), key.clone());
    let mut bob = NatTraversal::new(config("bob", vec![stun]), key);

    let (a, b) = tokio::join!(alice.connect("bob", Box::new(ta)), bob.connect("alice", Box::new(tb)));
    let a = assert_ok!(a);
    let b = assert_ok!(b);

    assert_eq!(alice.state(), &ConnectionState::Connected);
    assert_eq!(bob.state(), &ConnectionState::Connected);
    assert_eq!(a.path, PathKind::Direct);
    assert!(a.punch.is_some());
    assert_eq!(a.session.link_kind(), "direct");

    assert_eq!(a.remote.peer_id, "bob");
    assert_eq!(a.remote.nonce, b.local.nonce);
    assert_eq!(a.remote.virtual_ip, virtual_ip("loopback-net", "bob"));
    assert_eq!(b.session.remote_virtual_ip(), virtual_ip("loopback-net", "alice"));
    // One responder cannot tell cone types apart
    assert_eq!(a.local.nat_profile.nat_type, NatType::Unknown);

    assert_ok!(a.session.send(Bytes::from_static(b"hello bob")).await);
    assert_eq!(b.session.recv().await, Some(Bytes::from_static(b"hello bob")));
    assert_ok!(b.session.send(Bytes::from_static(b"hello alice")).await);
    assert_eq!(a.session.recv().await, Some(Bytes::from_static(b"hello alice")));

    a.session.close().await;
    b.session.wait_closed().await;
    assert_eq!(b.session.state(), SessionState::Closed);
}

#[tokio::test]
async fn mismatched_keys_never_punch() {
    let stun = stun_responder(0).await;
    let (ta, tb) = MemoryTransport::pair();

    let short = |id: &str| {
        let mut c = config(id, vec![stun]);
        c.punch.attempts = 6;
        c
    };
    let mut alice = NatTraversal::new(short("alice"), NetworkKey::from_bytes([1; 32]));
    let mut bob = NatTraversal::new(short("bob"), NetworkKey::from_bytes([2; 32]));

    let (a, b) = tokio::join!(alice.connect("bob", Box::new(ta)), bob.connect("alice", Box::new(tb)));
    assert!(matches!(assert_err!(a), ConnectError::NoPath { .. }));
    assert!(matches!(assert_err!(b), ConnectError::NoPath { .. }));
    assert!(matches!(alice.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn symmetric_peers_report_no_path() {
    // Two responders that disagree on the mapped port look symmetric
    let servers = vec![stun_responder(7).await, stun_responder(11).await];
    let key = NetworkKey::from_bytes([3; 32]);
    let (ta, tb) = MemoryTransport::pair();

    let short = |id: &str| {
        let mut c = config(id, servers.clone());
        c.punch.attempts = 6;
        c
    };
    let mut alice = NatTraversal::new(short("alice"), key.clone());
    let mut bob = NatTraversal::new(short("bob"), key);

    let (a, _b) = tokio::join!(alice.connect("bob", Box::new(ta)), bob.connect("alice", Box::new(tb)));
    match assert_err!(a) {
        ConnectError::NoPath { local, remote, outlook } => {
            assert_eq!(local.nat_type, NatType::Symmetric);
            assert_eq!(remote.nat_type, NatType::Symmetric);
            assert_eq!(outlook, PunchOutlook::Unlikely);
        }
        other => panic!("expected NoPath, got {other}"),
    }
}

#[tokio::test]
async fn symmetric_peers_fall_back_to_relay() {
    let servers = vec![stun_responder(7).await, stun_responder(11).await];
    let turn = turn_server().await;
    let key = NetworkKey::from_bytes([4; 32]);
    let (ta, tb) = MemoryTransport::pair();

    let with_relay = |id: &str| {
        let mut c = config(id, servers.clone());
        c.punch.attempts = 6;
        c.relay = Some(TurnConfig {
            retry: StunConfig {
                attempts: 2,
                initial_timeout: Duration::from_millis(200),
            },
            ..TurnConfig::new(turn, "user", "pass")
        });
        c
    };
    let mut alice = NatTraversal::new(with_relay("alice"), key.clone());
    let mut bob = NatTraversal::new(with_relay("bob"), key);

    let (a, b) = tokio::join!(alice.connect("bob", Box::new(ta)), bob.connect("alice", Box::new(tb)));
    let a = assert_ok!(a);
    let b = assert_ok!(b);

    assert_eq!(a.path, PathKind::Relayed);
    assert!(a.punch.is_none());
    assert_eq!(b.session.link_kind(), "relay");

    assert_ok!(a.session.send(Bytes::from_static(b"via relay")).await);
    assert_eq!(b.session.recv().await, Some(Bytes::from_static(b"via relay")));

    a.session.close().await;
    b.session.close().await;
}

#[tokio::test]
async fn unexpected_peer_is_rejected() {
    let stun = stun_responder(0).await;
    let key = NetworkKey::from_bytes([9; 32]);
    let (ta, tb) = MemoryTransport::pair();

    let mut alice = NatTraversal::new(config("alice", vec![stun]), key.clone());
    let mut mallory = NatTraversal::new(config("mallory", vec![stun]), key);

    let (a, _m) = tokio::join!(
        alice.connect("bob", Box::new(ta)),
        tokio::time::timeout(Duration::from_secs(3), mallory.connect("alice", Box::new(tb)))
    );
    assert!(matches!(
        assert_err!(a),
        ConnectError::UnexpectedPeer { expected, got } if expected == "bob" && got == "mallory"
    ));
}

#[tokio::test]
async fn missing_stun_answer_is_a_discovery_error() {
    // Nothing listens here
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let (ta, _tb) = MemoryTransport::pair();

    let mut alice = NatTraversal::new(config("alice", vec![addr]), NetworkKey::from_bytes([0; 32]));
    let result = alice.connect("bob", Box::new(ta)).await;
    assert!(matches!(assert_err!(result), ConnectError::Discovery));
}
