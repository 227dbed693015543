use std::net::Ipv4Addr;

use bp_common::constants::MBPS;

use crate::IfaceId;

/// The kind of medium behind a local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IfaceKind {
    #[default]
    Terrestrial,
    /// Long-haul satellite link. Assumed permanently up, reserved for satellite-flagged flows.
    Satellite,
}

/// Static configuration of one local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub addr: Ipv4Addr,
    pub kind: IfaceKind,
    /// Nominal link rate in bits per second.
    pub bit_rate: u64,
}

impl InterfaceConfig {
    /// A terrestrial interface with the given address and bit rate.
    pub fn terrestrial(addr: Ipv4Addr, bit_rate: u64) -> Self {
        Self { addr, kind: IfaceKind::Terrestrial, bit_rate }
    }

    /// A satellite interface with the given address and bit rate.
    pub fn satellite(addr: Ipv4Addr, bit_rate: u64) -> Self {
        Self { addr, kind: IfaceKind::Satellite, bit_rate }
    }
}

/// The set of local interfaces of a node and their administrative state.
#[derive(Debug, Clone)]
pub struct Interfaces {
    configs: Vec<InterfaceConfig>,
    up: Vec<bool>,
}

impl Interfaces {
    /// Creates the interface set. All interfaces start up.
    pub fn new(configs: Vec<InterfaceConfig>) -> Self {
        let up = vec![true; configs.len()];
        Self { configs, up }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn get(&self, iface: IfaceId) -> Option<&InterfaceConfig> {
        self.configs.get(iface.index())
    }

    #[inline]
    pub fn contains(&self, iface: IfaceId) -> bool {
        iface.index() < self.configs.len()
    }

    /// Returns `true` if the interface exists and is up. The satellite interface is always up.
    pub fn is_up(&self, iface: IfaceId) -> bool {
        match self.configs.get(iface.index()) {
            Some(config) if config.kind == IfaceKind::Satellite => true,
            Some(_) => self.up[iface.index()],
            None => false,
        }
    }

    /// Sets the administrative state. Returns `true` if the state changed.
    pub fn set_up(&mut self, iface: IfaceId, up: bool) -> bool {
        match self.up.get_mut(iface.index()) {
            Some(state) if *state != up => {
                *state = up;
                true
            }
            _ => false,
        }
    }

    pub fn kind(&self, iface: IfaceId) -> Option<IfaceKind> {
        self.get(iface).map(|c| c.kind)
    }

    /// The designated always-on satellite interface, if any.
    pub fn satellite(&self) -> Option<IfaceId> {
        self.configs.iter().position(|c| c.kind == IfaceKind::Satellite).map(|i| IfaceId(i as u8))
    }

    /// The node's main address: the address of the first interface.
    pub fn main_addr(&self) -> Option<Ipv4Addr> {
        self.configs.first().map(|c| c.addr)
    }

    /// Looks up a local interface by address.
    pub fn by_addr(&self, addr: Ipv4Addr) -> Option<IfaceId> {
        self.configs.iter().position(|c| c.addr == addr).map(|i| IfaceId(i as u8))
    }

    /// Link rate of an interface in Mbit/s, `0.0` if unknown.
    pub fn rate_mbps(&self, iface: IfaceId) -> f64 {
        self.get(iface).map(|c| c.bit_rate as f64 / MBPS as f64).unwrap_or_default()
    }

    pub fn ids(&self) -> impl Iterator<Item = IfaceId> + '_ {
        (0..self.configs.len()).map(|i| IfaceId(i as u8))
    }

    pub fn up_ids(&self) -> impl Iterator<Item = IfaceId> + '_ {
        self.ids().filter(|&i| self.is_up(i))
    }
}
