use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{net::UdpSocket, time::timeout};

use bp_daemon::{Daemon, DaemonOptions, DaemonStats, IfaceSocket};
use bp_routing::{
    Directory, IfaceId, InterfaceConfig, LinkKind, NodeId, NodeRole, PacketMeta, Position,
    RouterOptions, ShortestPathOracle, Topology,
};

const RATE: u64 = 10_000_000;

fn addr(i: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, i + 1)
}

/// A line of `n` nodes, 100 m apart.
fn line(n: u8) -> (Arc<Directory>, Arc<ShortestPathOracle>) {
    let mut topology = Topology::new();
    for i in 0..n {
        topology
            .add_node(NodeRole::Terrestrial, Position::new(f64::from(i) * 100.0, 0.0), [addr(i)])
            .unwrap();
    }
    for i in 1..u32::from(n) {
        topology.add_link(NodeId(i - 1), NodeId(i), LinkKind::Terrestrial).unwrap();
    }

    topology.build()
}

fn options(i: u8) -> DaemonOptions {
    let router =
        RouterOptions::default().with_interface(InterfaceConfig::terrestrial(addr(i), RATE));

    DaemonOptions::new(router)
        .with_hello_interval(Duration::from_millis(50))
        .with_vcalc_interval(Duration::from_millis(20))
        .with_housekeeping_interval(Duration::from_millis(100))
}

async fn loopback_socket() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap();
    (socket, local)
}

/// Starts two neighboring nodes whose control sockets point at each other.
async fn pair(
    topo: &(Arc<Directory>, Arc<ShortestPathOracle>),
) -> (Daemon<Bytes>, Daemon<Bytes>, SocketAddr) {
    let (socket_a, local_a) = loopback_socket().await;
    let (socket_b, local_b) = loopback_socket().await;

    let a = Daemon::with_sockets(
        options(0),
        Arc::clone(&topo.0),
        Arc::clone(&topo.1),
        vec![IfaceSocket::from_socket(socket_a, local_b)],
    )
    .unwrap();
    let b = Daemon::with_sockets(
        options(1),
        Arc::clone(&topo.0),
        Arc::clone(&topo.1),
        vec![IfaceSocket::from_socket(socket_b, local_a)],
    )
    .unwrap();

    (a, b, local_a)
}

async fn wait_for(stats: &DaemonStats, check: impl Fn(&DaemonStats) -> bool) -> bool {
    for _ in 0..100 {
        if check(stats) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    false
}

fn has_neighbor(stats: &DaemonStats) -> bool {
    stats.telemetry().is_some_and(|t| t.neighbors == 1)
}

#[tokio::test]
async fn hello_exchange_discovers_neighbors() {
    let _ = tracing_subscriber::fmt::try_init();

    let topo = line(2);
    let (a, b, _) = pair(&topo).await;

    assert!(wait_for(a.stats(), has_neighbor).await);
    assert!(wait_for(b.stats(), has_neighbor).await);

    assert!(a.stats().hellos_tx() > 0);
    assert!(b.stats().hellos_rx() > 0);
    assert_eq!(a.stats().decode_errors(), 0);

    // With empty queues V sits at its ceiling.
    assert!(wait_for(a.stats(), |s| s.v() == vec![400.0]).await);
}

#[tokio::test]
async fn forwards_towards_destination() {
    let _ = tracing_subscriber::fmt::try_init();

    let topo = line(3);
    let (mut a, b, _) = pair(&topo).await;
    assert!(wait_for(a.stats(), has_neighbor).await);

    let meta = PacketMeta::udp(addr(0), 4000, addr(2), 5000);
    a.enqueue(Bytes::from_static(b"payload"), meta, None, None).await.unwrap();
    a.dequeue_ready(IfaceId(0)).await.unwrap();

    let fwd = timeout(Duration::from_secs(2), a.next()).await.unwrap().unwrap();
    assert_eq!(fwd.route.next_hop, addr(1));
    assert_eq!(fwd.route.out_iface, IfaceId(0));
    assert_eq!(fwd.meta.ttl, 63);
    assert_eq!(fwd.packet, Bytes::from_static(b"payload"));

    // B only knows A, and sending the packet back where it came from never pays off.
    assert!(wait_for(b.stats(), has_neighbor).await);
    b.enqueue(fwd.packet, fwd.meta, Some(IfaceId(0)), Some(a.main_addr())).await.unwrap();
    b.dequeue_ready(IfaceId(0)).await.unwrap();

    assert!(wait_for(b.stats(), |s| s.telemetry().is_some_and(|t| t.stats.held == 1)).await);
    assert_eq!(b.stats().telemetry().map(|t| t.backlog), Some(1));
}

#[tokio::test]
async fn malformed_datagrams_are_discarded() {
    let _ = tracing_subscriber::fmt::try_init();

    let topo = line(2);
    let (a, _b, local_a) = pair(&topo).await;
    assert!(wait_for(a.stats(), has_neighbor).await);

    let (garbage, _) = loopback_socket().await;
    garbage.send_to(&[0x00, 0x40, 0x00, 0x01, 0xff], local_a).await.unwrap();
    garbage.send_to(&[0x00], local_a).await.unwrap();

    assert!(wait_for(a.stats(), |s| s.decode_errors() == 2).await);

    // HELLOs keep flowing on the same socket.
    let received = a.stats().hellos_rx();
    assert!(wait_for(a.stats(), |s| s.hellos_rx() > received).await);
    assert!(has_neighbor(a.stats()));
}

#[tokio::test]
async fn shutdown_ends_the_stream() {
    let _ = tracing_subscriber::fmt::try_init();

    let topo = line(2);
    let (mut a, _b, _) = pair(&topo).await;

    a.shutdown().await.unwrap();
    assert!(timeout(Duration::from_secs(1), a.next()).await.unwrap().is_none());

    let meta = PacketMeta::udp(addr(0), 4000, addr(1), 5000);
    assert!(a.enqueue(Bytes::new(), meta, None, None).await.is_err());
}

#[tokio::test]
async fn rejects_socket_mismatch() {
    let topo = line(2);
    let result = Daemon::<Bytes>::with_sockets(options(0), topo.0, topo.1, vec![]);
    assert!(matches!(result, Err(bp_daemon::DaemonError::SocketCount { expected: 1, got: 0 })));
}
