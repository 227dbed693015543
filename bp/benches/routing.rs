use std::{net::Ipv4Addr, sync::Arc, time::{Duration, Instant}};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, SeedableRng};

use bp::{
    wire::{Hello, Message, Willingness},
    EngineOptions, IfaceId, InterfaceConfig, LinkKind, NodeId, NodeRole, PacketMeta, Position,
    Router, RouterOptions, RoutingPolicy, Topology,
};

const RATE: u64 = 54_000_000;

fn addr(i: u32) -> Ipv4Addr {
    Ipv4Addr::from(0x0a00_0001 + i)
}

/// A `k` by `k` grid with 4-neighborhood links.
fn grid(k: u32) -> Topology {
    let mut topology = Topology::new();
    for i in 0..k * k {
        let pos = Position::new(f64::from(i % k) * 100.0, f64::from(i / k) * 100.0);
        topology.add_node(NodeRole::Terrestrial, pos, [addr(i)]).unwrap();
    }

    for i in 0..k * k {
        if i % k + 1 < k {
            topology.add_link(NodeId(i), NodeId(i + 1), LinkKind::Terrestrial).unwrap();
        }
        if i + k < k * k {
            topology.add_link(NodeId(i), NodeId(i + k), LinkKind::Terrestrial).unwrap();
        }
    }

    topology
}

fn oracle_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("oracle_build");
    for k in [4, 8, 12] {
        let topology = grid(k);
        group.bench_with_input(BenchmarkId::from_parameter(k * k), &topology, |b, topology| {
            b.iter(|| topology.oracle())
        });
    }
    group.finish();
}

/// A hub linked to `n` spokes that all lead to one far destination.
fn select_next_hop(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_next_hop");

    for n in [4u32, 16, 64] {
        let mut topology = Topology::new();
        let hub = topology.add_node(NodeRole::Terrestrial, Position::default(), [addr(0)]).unwrap();
        let dst = topology
            .add_node(NodeRole::Gateway, Position::new(1000.0, 0.0), [addr(1)])
            .unwrap();
        for i in 0..n {
            let spoke = topology
                .add_node(NodeRole::Terrestrial, Position::new(500.0, f64::from(i)), [addr(2 + i)])
                .unwrap();
            topology.add_link(hub, spoke, LinkKind::Terrestrial).unwrap();
            topology.add_link(spoke, dst, LinkKind::Terrestrial).unwrap();
        }
        let (directory, oracle) = topology.build();

        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(0), RATE))
            .with_engine(EngineOptions::default().with_policy(RoutingPolicy::PerPacket));
        let mut router: Router<()> = Router::new(options, directory, oracle).unwrap();

        let now = Instant::now();
        for i in 0..n {
            let hello = Hello {
                willingness: Willingness::Default,
                queue_length: i % 7,
                addr: addr(2 + i),
                x: 500.0,
                y: f64::from(i),
                iface_queues: vec![(i % 7) as u8],
            };
            let message = Message::hello(addr(2 + i), 1, Duration::from_secs(3), hello.clone());
            router.on_hello(IfaceId(0), &message.header, &hello, now).unwrap();
        }

        let meta = PacketMeta::udp(addr(0), 4000, addr(1), 5000);
        for _ in 0..32 {
            router.enqueue((), meta, None, None, None, now);
        }

        let mut rng = StdRng::seed_from_u64(42);
        group.bench_function(BenchmarkId::from_parameter(n), |b| {
            b.iter(|| router.select_next_hop(&meta, None, None, Some(IfaceId(0)), now, &mut rng))
        });
    }

    group.finish();
}

criterion_group!(benches, oracle_build, select_next_hop);
criterion_main!(benches);
