use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::BytesMut;
use futures::{Future, StreamExt};
use rand::rngs::StdRng;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_stream::StreamMap;
use tokio_util::{codec::Encoder, udp::UdpFramed};
use tracing::{debug, error, trace, warn};

use bp_common::PeriodicTimer;
use bp_routing::{DequeueOutcome, EnqueueOutcome, Forwarding, IfaceId, Router};
use bp_wire::{Codec, Packet};

use crate::{Command, DaemonOptions, DaemonStats};

type HelloStream = UdpFramed<Codec, Arc<UdpSocket>>;

/// Sending half of an interface's control socket.
#[derive(Debug)]
pub(crate) struct HelloSink {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) broadcast: SocketAddr,
}

pub(crate) struct DaemonDriver<P> {
    /// Options shared with the handle.
    pub(crate) options: Arc<DaemonOptions>,
    pub(crate) router: Router<P>,
    /// Incoming control packets, keyed by the interface they arrived on.
    pub(crate) sockets: StreamMap<IfaceId, HelloStream>,
    /// Outgoing control sockets, indexed by interface.
    pub(crate) sinks: Vec<HelloSink>,
    /// Commands from the handle.
    pub(crate) from_daemon: mpsc::Receiver<Command<P>>,
    /// Forwarding decisions to the handle.
    pub(crate) to_daemon: mpsc::Sender<Forwarding<P>>,
    pub(crate) hello_timer: PeriodicTimer,
    pub(crate) vcalc_timer: PeriodicTimer,
    pub(crate) avg_timer: PeriodicTimer,
    pub(crate) housekeeping_timer: PeriodicTimer,
    /// Stats shared with the handle.
    pub(crate) stats: Arc<DaemonStats>,
    pub(crate) rng: StdRng,
    pub(crate) codec: Codec,
    pub(crate) write_buf: BytesMut,
}

impl<P> std::fmt::Debug for DaemonDriver<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonDriver")
            .field("main_addr", &self.router.main_addr())
            .field("port", &self.options.port)
            .field("sockets", &self.sinks.len())
            .finish()
    }
}

impl<P: Send + 'static> Future for DaemonDriver<P> {
    type Output = ();

    /// Commands go first, then control packets, then timers. Each event runs to completion.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.from_daemon.poll_recv(cx) {
                Poll::Ready(Some(Command::Shutdown)) | Poll::Ready(None) => {
                    this.shutdown();
                    return Poll::Ready(());
                }
                Poll::Ready(Some(cmd)) => {
                    this.on_command(cmd);
                    this.publish_telemetry();
                    continue;
                }
                Poll::Pending => {}
            }

            if let Poll::Ready(Some((iface, result))) = this.sockets.poll_next_unpin(cx) {
                match result {
                    Ok((packet, from)) => this.on_packet(iface, packet, from),
                    Err(e) => {
                        this.stats.increment_decode_errors();
                        warn!(err = ?e, %iface, "Discarding malformed control packet");
                    }
                }

                continue;
            }

            if let Poll::Ready(Some(_)) = this.hello_timer.poll_tick(cx) {
                this.send_hellos();
                continue;
            }

            if let Poll::Ready(Some(_)) = this.vcalc_timer.poll_tick(cx) {
                let v = this.router.recompute_v(Instant::now().into_std());
                trace!(?v, "V recalculated");
                this.publish_telemetry();
                continue;
            }

            if let Poll::Ready(Some(_)) = this.avg_timer.poll_tick(cx) {
                this.router.sample_backlog();
                continue;
            }

            if let Poll::Ready(Some(_)) = this.housekeeping_timer.poll_tick(cx) {
                this.router.housekeeping(Instant::now().into_std());
                this.publish_telemetry();
                continue;
            }

            return Poll::Pending;
        }
    }
}

impl<P: Send + 'static> DaemonDriver<P> {
    fn on_command(&mut self, cmd: Command<P>) {
        let now = Instant::now().into_std();

        match cmd {
            Command::Enqueue { packet, meta, in_iface, prev_hop, src_hw } => {
                match self.router.enqueue(packet, meta, in_iface, prev_hop, src_hw, now) {
                    EnqueueOutcome::Queued(iface) => trace!(dst = %meta.dst, %iface, "Enqueued"),
                    outcome => debug!(dst = %meta.dst, ?outcome, "Dropped packet on arrival"),
                }
            }
            Command::DequeueReady { iface } => {
                match self.router.on_dequeue_ready(iface, now, &mut self.rng) {
                    DequeueOutcome::Forward(forwarding) => self.forward(forwarding),
                    DequeueOutcome::Moved { to } => {
                        trace!(from = %iface, %to, "Moved head of line")
                    }
                    DequeueOutcome::Held { dst } => trace!(%iface, %dst, "Holding head of line"),
                    DequeueOutcome::Idle => {}
                }
            }
            Command::InterfaceUp { iface } => match self.router.set_iface_up(iface) {
                Ok(true) => {
                    debug!(%iface, "Interface up, announcing");
                    self.send_hello(iface);
                }
                Ok(false) => {}
                Err(e) => warn!(err = %e, "Ignoring interface up"),
            },
            Command::InterfaceDown { iface } => match self.router.set_iface_down(iface) {
                Ok(moved) => debug!(%iface, moved, "Interface down"),
                Err(e) => warn!(err = %e, "Ignoring interface down"),
            },
            Command::NeighborHwAddr { addr, hw_addr } => {
                self.router.set_neighbor_hw_addr(addr, hw_addr);
            }
            // Handled by the poll loop.
            Command::Shutdown => {}
        }
    }

    fn forward(&mut self, forwarding: Forwarding<P>) {
        if let Err(e) = self.to_daemon.try_send(forwarding) {
            self.stats.increment_forward_drops();
            match e {
                TrySendError::Full(f) => {
                    warn!(dst = %f.meta.dst, "Forwarding channel full, dropping packet")
                }
                TrySendError::Closed(_) => debug!("Daemon handle gone, dropping packet"),
            }
        }
    }

    fn on_packet(&mut self, iface: IfaceId, packet: Packet, from: SocketAddr) {
        if !self.router.interfaces().is_up(iface) {
            trace!(%iface, %from, "Interface down, ignoring control packet");
            return;
        }

        let now = Instant::now().into_std();
        for (header, hello) in packet.hellos() {
            match self.router.on_hello(iface, header, hello, now) {
                Ok(Some(outcome)) => {
                    self.stats.increment_hellos_rx();
                    trace!(%iface, %from, neighbor = %hello.addr, ?outcome, "HELLO");
                }
                Ok(None) => trace!(%iface, "Ignoring own HELLO"),
                Err(e) => error!(err = %e, "Failed to process HELLO"),
            }
        }
    }

    fn send_hellos(&mut self) {
        for i in 0..self.sinks.len() {
            self.send_hello(IfaceId(i as u8));
        }
    }

    fn send_hello(&mut self, iface: IfaceId) {
        let Some(packet) = self.router.build_hello(iface) else {
            return;
        };
        let Some(sink) = self.sinks.get(iface.index()) else {
            return;
        };

        self.write_buf.clear();
        if let Err(e) = self.codec.encode(packet, &mut self.write_buf) {
            self.stats.increment_send_errors();
            error!(err = ?e, %iface, "Failed to encode HELLO");
            return;
        }

        // Control traffic is best effort: a HELLO that doesn't go out now is replaced by the
        // next one.
        match sink.socket.try_send_to(&self.write_buf, sink.broadcast) {
            Ok(_) => {
                self.stats.increment_hellos_tx();
                trace!(%iface, to = %sink.broadcast, "Sent HELLO");
            }
            Err(e) => {
                self.stats.increment_send_errors();
                debug!(err = %e, %iface, "Failed to send HELLO");
            }
        }
    }

    fn publish_telemetry(&self) {
        self.stats.set_telemetry(self.router.telemetry());
    }

    fn shutdown(&mut self) {
        for timer in [
            &mut self.hello_timer,
            &mut self.vcalc_timer,
            &mut self.avg_timer,
            &mut self.housekeeping_timer,
        ] {
            timer.cancel();
        }

        self.publish_telemetry();
        debug!(
            main_addr = %self.router.main_addr(),
            backlog = self.router.queue().len(),
            "Shutting down"
        );
    }
}
