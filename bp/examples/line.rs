//! Three nodes in a line, A - B - C, talking HELLOs over loopback. A packet from A to C is
//! relayed by B.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::UdpSocket;

use bp::{
    Daemon, DaemonOptions, IfaceId, IfaceSocket, InterfaceConfig, LinkKind, NodeRole, PacketMeta,
    Position, RouterOptions, Topology,
};

const RATE: u64 = 11_000_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();

    let addrs: Vec<Ipv4Addr> = (1..=3).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();

    let mut topology = Topology::new();
    let ids = addrs
        .iter()
        .enumerate()
        .map(|(i, &a)| {
            topology.add_node(NodeRole::Terrestrial, Position::new(i as f64 * 100.0, 0.0), [a])
        })
        .collect::<Result<Vec<_>, _>>()?;
    topology.add_link(ids[0], ids[1], LinkKind::Terrestrial)?;
    topology.add_link(ids[1], ids[2], LinkKind::Terrestrial)?;
    let (directory, oracle) = topology.build();

    // Loopback has no broadcast, so B gets one interface per link, each aimed at one neighbor.
    let a_sock = UdpSocket::bind("127.0.0.1:0").await?;
    let b0_sock = UdpSocket::bind("127.0.0.1:0").await?;
    let b1_sock = UdpSocket::bind("127.0.0.1:0").await?;
    let c_sock = UdpSocket::bind("127.0.0.1:0").await?;

    let (a_addr, b0_addr) = (a_sock.local_addr()?, b0_sock.local_addr()?);
    let (b1_addr, c_addr) = (b1_sock.local_addr()?, c_sock.local_addr()?);

    let options = |ifaces: &[Ipv4Addr]| {
        let router = ifaces.iter().fold(RouterOptions::default(), |o, &a| {
            o.with_interface(InterfaceConfig::terrestrial(a, RATE))
        });
        DaemonOptions::new(router).with_hello_interval(Duration::from_millis(100))
    };

    let mut a: Daemon<Bytes> = Daemon::with_sockets(
        options(&addrs[..1]),
        Arc::clone(&directory),
        Arc::clone(&oracle),
        vec![IfaceSocket::from_socket(a_sock, b0_addr)],
    )?;
    let mut b: Daemon<Bytes> = Daemon::with_sockets(
        options(&[addrs[1], Ipv4Addr::new(10, 1, 0, 2)]),
        Arc::clone(&directory),
        Arc::clone(&oracle),
        vec![IfaceSocket::from_socket(b0_sock, a_addr), IfaceSocket::from_socket(b1_sock, c_addr)],
    )?;
    let _c: Daemon<Bytes> = Daemon::with_sockets(
        options(&addrs[2..]),
        directory,
        oracle,
        vec![IfaceSocket::from_socket(c_sock, b1_addr)],
    )?;

    // Let a few HELLO rounds go by.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let meta = PacketMeta::udp(addrs[0], 4000, addrs[2], 5000);
    a.enqueue(Bytes::from("hello C"), meta, None, None).await?;
    a.dequeue_ready(IfaceId(0)).await?;

    let Some(hop) = a.next().await else {
        return Err("A shut down".into());
    };
    println!("A -> {} via {} (ttl {})", hop.route.next_hop, hop.route.out_iface, hop.meta.ttl);

    b.enqueue(hop.packet, hop.meta, Some(IfaceId(0)), Some(a.main_addr())).await?;
    // The packet is queued on B's first interface; the decision may move it to the second.
    b.dequeue_ready(IfaceId(0)).await?;
    b.dequeue_ready(IfaceId(1)).await?;

    let Some(hop) = b.next().await else {
        return Err("B shut down".into());
    };
    println!(
        "B -> {} via {} (ttl {}): {:?}",
        hop.route.next_hop, hop.route.out_iface, hop.meta.ttl, hop.packet
    );

    if let Some(telemetry) = b.stats().telemetry() {
        println!("B: {telemetry:?}");
    }

    Ok(())
}
