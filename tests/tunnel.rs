//! Tunnel bridge over two loopback sessions

use bytes::Bytes;
use meshlink::mesh::{MeshSession, NetworkKey, PunchedSocket, SessionConfig};
use meshlink::nat_traversal::{virtual_ip, NatProfile, PeerDescriptor, TransportAddress};
use meshlink::tunnel::{AdapterHandle, ChannelAdapter, TunnelBridge, TunnelConfig, VirtualAdapter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

fn descriptor(peer_id: &str, addr: SocketAddr, nonce: u64) -> PeerDescriptor {
    PeerDescriptor {
        peer_id: peer_id.into(),
        reflexive_address: TransportAddress::udp(addr),
        nat_profile: NatProfile::unknown(None),
        nonce,
        virtual_ip: virtual_ip("tunnel-test", peer_id),
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        hello_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(3),
        max_datagram: 600,
        ..SessionConfig::default()
    }
}

async fn sessions() -> (Arc<MeshSession>, Arc<MeshSession>) {
    let key = NetworkKey::from_bytes([8; 32]);
    let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());
    let (alice, bob) = (descriptor("alice", a_addr, 10), descriptor("bob", b_addr, 20));

    let sa = MeshSession::start(
        Box::new(PunchedSocket::new(a, b_addr)),
        &key,
        alice.clone(),
        bob.clone(),
        session_config(),
    );
    let sb = MeshSession::start(Box::new(PunchedSocket::new(b, a_addr)), &key, bob, alice, session_config());
    assert_ok!(sa.wait_established().await);
    assert_ok!(sb.wait_established().await);
    (Arc::new(sa), Arc::new(sb))
}

fn bridge(
    session: Arc<MeshSession>,
    cancel: &CancellationToken,
) -> (AdapterHandle, JoinHandle<Result<meshlink::tunnel::BridgeStats, meshlink::tunnel::TunnelError>>) {
    let (adapter, handle) = ChannelAdapter::pair(1500, 16);
    let adapter: Arc<dyn VirtualAdapter> = Arc::new(adapter);
    let bridge = TunnelBridge::new(session, adapter, TunnelConfig::default()).unwrap();
    (handle, tokio::spawn(bridge.run(cancel.clone())))
}

fn ipv4_packet(len: usize) -> Bytes {
    let mut packet: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    packet[0] = 0x45;
    Bytes::from(packet)
}

#[tokio::test]
async fn large_packet_crosses_byte_identical() {
    let (sa, sb) = sessions().await;
    let cancel = CancellationToken::new();
    let (ha, task_a) = bridge(sa.clone(), &cancel);
    let (mut hb, task_b) = bridge(sb.clone(), &cancel);

    // Larger than one 600-byte datagram, so it travels in fragments
    let packet = ipv4_packet(4000);
    assert_ok!(ha.inject(packet.clone()).await);
    let received = tokio::time::timeout(Duration::from_secs(3), hb.next()).await.unwrap();
    assert_eq!(received, Some(packet));

    let small = ipv4_packet(60);
    assert_ok!(ha.inject(small.clone()).await);
    assert_eq!(hb.next().await, Some(small));

    cancel.cancel();
    let stats_a = task_a.await.unwrap().unwrap();
    let stats_b = task_b.await.unwrap().unwrap();
    assert_eq!(stats_a.packets_out, 2);
    assert!(stats_a.fragments_out > 2);
    assert_eq!(stats_b.packets_in, 2);
    assert_eq!(stats_b.bytes_in, 4060);
    assert_eq!(stats_b.fragments_in, stats_a.fragments_out);

    sa.close().await;
    sb.close().await;
}

#[tokio::test]
async fn bridge_exits_when_session_closes() {
    let (sa, sb) = sessions().await;
    let cancel = CancellationToken::new();
    let (_hb, task_b) = bridge(sb.clone(), &cancel);

    sa.close().await;
    let stats = tokio::time::timeout(Duration::from_secs(3), task_b).await.unwrap().unwrap();
    assert_ok!(stats);
}

#[tokio::test]
async fn packets_are_dropped_until_established() {
    // The peer never answers, so the session stays in its handshake
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let session = Arc::new(MeshSession::start(
        Box::new(PunchedSocket::new(socket.clone(), silent_addr)),
        &NetworkKey::from_bytes([1; 32]),
        descriptor("alice", socket.local_addr().unwrap(), 1),
        descriptor("bob", silent_addr, 2),
        session_config(),
    ));

    let cancel = CancellationToken::new();
    let (adapter, handle) = ChannelAdapter::pair(1500, 4);
    let bridge = TunnelBridge::new(session.clone(), Arc::new(adapter), TunnelConfig::default()).unwrap();
    let mut stats = bridge.stats();
    let task = tokio::spawn(bridge.run(cancel.clone()));

    assert_ok!(handle.inject(ipv4_packet(100)).await);
    let seen = tokio::time::timeout(Duration::from_secs(2), stats.wait_for(|s| s.dropped_degraded == 1))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(seen.packets_out, 0);

    cancel.cancel();
    assert_ok!(task.await.unwrap());
    session.close().await;
}
