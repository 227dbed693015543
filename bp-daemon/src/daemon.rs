use std::{
    net::Ipv4Addr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::BytesMut;
use futures::Stream;
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::mpsc;
use tokio_stream::StreamMap;
use tokio_util::udp::UdpFramed;
use tracing::debug;

use bp_common::PeriodicTimer;
use bp_routing::{
    Directory, Forwarding, HwAddr, IfaceId, PacketMeta, Router, ShortestPathOracle,
};
use bp_wire::Codec;

use crate::{
    driver::{DaemonDriver, HelloSink},
    Command, DaemonError, DaemonOptions, DaemonStats, IfaceSocket,
};

/// Handle to a running node.
///
/// Yields the packets the node forwards, in decision order. Dropping the handle shuts the
/// driver down.
#[derive(Debug)]
pub struct Daemon<P> {
    to_driver: mpsc::Sender<Command<P>>,
    from_driver: mpsc::Receiver<Forwarding<P>>,
    main_addr: Ipv4Addr,
    /// Options shared with the driver.
    options: Arc<DaemonOptions>,
    stats: Arc<DaemonStats>,
}

impl<P: Send + 'static> Daemon<P> {
    /// Binds one control socket per configured interface on [`DaemonOptions::port`] and starts
    /// the node. Must be called within a tokio runtime.
    pub async fn bind(
        options: DaemonOptions,
        directory: Arc<Directory>,
        oracle: Arc<ShortestPathOracle>,
    ) -> Result<Self, DaemonError> {
        let mut sockets = Vec::with_capacity(options.router.interfaces.len());
        for iface in &options.router.interfaces {
            sockets.push(IfaceSocket::bind(iface.addr, options.port).await?);
        }

        Self::with_sockets(options, directory, oracle, sockets)
    }

    /// Starts the node on already bound sockets, one per interface in configuration order.
    /// Must be called within a tokio runtime.
    pub fn with_sockets(
        options: DaemonOptions,
        directory: Arc<Directory>,
        oracle: Arc<ShortestPathOracle>,
        sockets: Vec<IfaceSocket>,
    ) -> Result<Self, DaemonError> {
        let expected = options.router.interfaces.len();
        if sockets.len() != expected {
            return Err(DaemonError::SocketCount { expected, got: sockets.len() });
        }

        let router = Router::new(options.router.clone(), directory, oracle)?;
        let main_addr = router.main_addr();

        let (to_driver, from_daemon) = mpsc::channel(options.command_buffer_size);
        let (to_daemon, from_driver) = mpsc::channel(options.forward_buffer_size);

        let mut streams = StreamMap::with_capacity(sockets.len());
        let mut sinks = Vec::with_capacity(sockets.len());
        for (i, IfaceSocket { socket, broadcast }) in sockets.into_iter().enumerate() {
            streams.insert(IfaceId(i as u8), UdpFramed::new(Arc::clone(&socket), Codec::new()));
            sinks.push(HelloSink { socket, broadcast });
        }

        let options = Arc::new(options);
        let stats = Arc::new(DaemonStats::default());

        let driver = DaemonDriver {
            hello_timer: PeriodicTimer::new(options.hello_interval)
                .with_jitter(options.hello_jitter)
                .fire_immediately(),
            vcalc_timer: PeriodicTimer::new(options.vcalc_interval),
            avg_timer: PeriodicTimer::new(options.avg_queue_interval),
            housekeeping_timer: PeriodicTimer::new(options.housekeeping_interval),
            options: Arc::clone(&options),
            router,
            sockets: streams,
            sinks,
            from_daemon,
            to_daemon,
            stats: Arc::clone(&stats),
            rng: StdRng::from_entropy(),
            codec: Codec::new(),
            write_buf: BytesMut::with_capacity(256),
        };

        debug!(%main_addr, "Starting daemon");
        tokio::spawn(driver);

        Ok(Self { to_driver, from_driver, main_addr, options, stats })
    }
}

impl<P> Daemon<P> {
    /// The main address of the node.
    #[inline]
    pub fn main_addr(&self) -> Ipv4Addr {
        self.main_addr
    }

    pub fn options(&self) -> &DaemonOptions {
        &self.options
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Hands a packet to the node for routing. `in_iface` and `prev_hop` are `None` for
    /// locally originated packets.
    pub async fn enqueue(
        &self,
        packet: P,
        meta: PacketMeta,
        in_iface: Option<IfaceId>,
        prev_hop: Option<Ipv4Addr>,
    ) -> Result<(), DaemonError> {
        self.send_command(Command::Enqueue { packet, meta, in_iface, prev_hop, src_hw: None })
            .await
    }

    /// Like [`enqueue`](Self::enqueue) but fails immediately if the command channel is full.
    pub fn try_enqueue(
        &self,
        packet: P,
        meta: PacketMeta,
        in_iface: Option<IfaceId>,
        prev_hop: Option<Ipv4Addr>,
        src_hw: Option<HwAddr>,
    ) -> Result<(), DaemonError> {
        self.try_send_command(Command::Enqueue { packet, meta, in_iface, prev_hop, src_hw })
    }

    /// Signals that `iface` can transmit one packet.
    pub async fn dequeue_ready(&self, iface: IfaceId) -> Result<(), DaemonError> {
        self.send_command(Command::DequeueReady { iface }).await
    }

    pub async fn interface_up(&self, iface: IfaceId) -> Result<(), DaemonError> {
        self.send_command(Command::InterfaceUp { iface }).await
    }

    pub async fn interface_down(&self, iface: IfaceId) -> Result<(), DaemonError> {
        self.send_command(Command::InterfaceDown { iface }).await
    }

    /// Records the link-layer address of a neighbor interface.
    pub async fn set_neighbor_hw_addr(
        &self,
        addr: Ipv4Addr,
        hw_addr: HwAddr,
    ) -> Result<(), DaemonError> {
        self.send_command(Command::NeighborHwAddr { addr, hw_addr }).await
    }

    /// Stops the driver. Its timers are cancelled and no further packets are forwarded.
    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.send_command(Command::Shutdown).await
    }

    async fn send_command(&self, command: Command<P>) -> Result<(), DaemonError> {
        self.to_driver.send(command).await.map_err(|_| DaemonError::Closed)
    }

    fn try_send_command(&self, command: Command<P>) -> Result<(), DaemonError> {
        use mpsc::error::TrySendError::*;
        self.to_driver.try_send(command).map_err(|e| match e {
            Full(_) => DaemonError::ChannelFull,
            Closed(_) => DaemonError::Closed,
        })
    }
}

impl<P> Drop for Daemon<P> {
    fn drop(&mut self) {
        // Try to tell the driver to shut down.
        let _ = self.to_driver.try_send(Command::Shutdown);
    }
}

impl<P> Stream for Daemon<P> {
    type Item = Forwarding<P>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.from_driver.poll_recv(cx)
    }
}
