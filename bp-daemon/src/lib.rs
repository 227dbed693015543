//! Async driver for a [`Router`](bp_routing::Router).
//!
//! A [`Daemon`] owns one node: its router, a UDP control socket per interface and the periodic
//! HELLO, V-recalculation, backlog-averaging and housekeeping timers. All of that state lives in
//! a single driver task; the handle talks to it over channels and yields forwarding decisions as
//! a [`Stream`](futures::Stream).

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::net::UdpSocket;

use bp_routing::{HwAddr, IfaceId, PacketMeta, RouterError, RouterOptions};

mod daemon;
pub use daemon::Daemon;

mod driver;

mod stats;
pub use stats::DaemonStats;

const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Expected one socket per interface ({expected}), got {got}")]
    SocketCount { expected: usize, got: usize },
    #[error("Daemon closed")]
    Closed,
    #[error("Command channel full")]
    ChannelFull,
}

/// Commands from the [`Daemon`] handle to the driver.
#[derive(Debug)]
pub(crate) enum Command<P> {
    /// A packet arrived, locally or from a neighbor.
    Enqueue {
        packet: P,
        meta: PacketMeta,
        in_iface: Option<IfaceId>,
        prev_hop: Option<Ipv4Addr>,
        src_hw: Option<HwAddr>,
    },
    /// The interface can transmit one packet.
    DequeueReady { iface: IfaceId },
    InterfaceUp { iface: IfaceId },
    InterfaceDown { iface: IfaceId },
    /// The link-layer address of a neighbor interface became known.
    NeighborHwAddr { addr: Ipv4Addr, hw_addr: HwAddr },
    /// Shut down the driver.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub router: RouterOptions,
    /// UDP port of the control sockets.
    pub port: u16,
    pub hello_interval: Duration,
    /// Maximum random amount taken off each HELLO period.
    pub hello_jitter: Duration,
    pub vcalc_interval: Duration,
    pub avg_queue_interval: Duration,
    pub housekeeping_interval: Duration,
    /// Capacity of the command channel.
    pub command_buffer_size: usize,
    /// Capacity of the forwarding channel. Decisions that don't fit are dropped.
    pub forward_buffer_size: usize,
}

impl DaemonOptions {
    pub fn new(router: RouterOptions) -> Self {
        Self { router, ..Default::default() }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the HELLO interval. The jitter is reset to a quarter of it.
    pub fn with_hello_interval(mut self, interval: Duration) -> Self {
        self.hello_interval = interval;
        self.hello_jitter = interval / 4;
        self
    }

    pub fn with_vcalc_interval(mut self, interval: Duration) -> Self {
        self.vcalc_interval = interval;
        self
    }

    pub fn with_avg_queue_interval(mut self, interval: Duration) -> Self {
        self.avg_queue_interval = interval;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_forward_buffer_size(mut self, size: usize) -> Self {
        self.forward_buffer_size = size;
        self
    }
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            router: RouterOptions::default(),
            port: bp_wire::DEFAULT_PORT,
            hello_interval: Duration::from_secs(1),
            hello_jitter: Duration::from_millis(250),
            vcalc_interval: Duration::from_millis(100),
            avg_queue_interval: Duration::from_millis(100),
            housekeeping_interval: Duration::from_secs(1),
            command_buffer_size: DEFAULT_BUFFER_SIZE,
            forward_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// The control socket of one interface and where its HELLOs are sent.
#[derive(Debug, Clone)]
pub struct IfaceSocket {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) broadcast: SocketAddr,
}

impl IfaceSocket {
    /// Binds a broadcast-enabled socket to `addr:port`. HELLOs go to the limited broadcast
    /// address on the same port.
    pub async fn bind(addr: Ipv4Addr, port: u16) -> Result<Self, DaemonError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(addr, port)).await?;
        socket.set_broadcast(true)?;

        Ok(Self::from_socket(socket, SocketAddrV4::new(Ipv4Addr::BROADCAST, port).into()))
    }

    /// Wraps an already bound socket. HELLOs are sent to `broadcast`.
    pub fn from_socket(socket: UdpSocket, broadcast: SocketAddr) -> Self {
        Self { socket: Arc::new(socket), broadcast }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DaemonError> {
        Ok(self.socket.local_addr()?)
    }
}
