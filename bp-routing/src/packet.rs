use std::net::Ipv4Addr;

/// Snapshot of the IP/transport header fields the routing decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketMeta {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// Remaining time-to-live.
    pub ttl: u8,
    /// Whether the flow may use satellite interfaces.
    pub satellite: bool,
    /// Packet size in bytes.
    pub size: u32,
}

impl PacketMeta {
    /// A UDP packet header with the default TTL of 64.
    pub fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self { src, dst, src_port, dst_port, protocol: 17, ttl: 64, satellite: false, size: 0 }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Marks the flow as eligible for satellite interfaces.
    pub fn satellite(mut self) -> Self {
        self.satellite = true;
        self
    }

    #[inline]
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src: self.src,
            dst: self.dst,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }
}

/// Identifies a flow for route caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}
