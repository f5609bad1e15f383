use std::{net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::network::{
    lsa::Lsa,
    router::{AreaId, IntfKey, RouterId},
};

/// Already-decoded OSPF packets exchanged with the packet I/O collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OspfPacket {
    Hello(Hello),
    LsUpdate(LsUpdate),
}

impl OspfPacket {
    pub fn router_id(&self) -> RouterId {
        match self {
            OspfPacket::Hello(hello) => hello.router_id,
            OspfPacket::LsUpdate(update) => update.router_id,
        }
    }

    pub fn area(&self) -> AreaId {
        match self {
            OspfPacket::Hello(hello) => hello.area,
            OspfPacket::LsUpdate(update) => update.area,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub router_id: RouterId,
    pub area: AreaId,
    pub network_mask: Ipv4Addr,
    pub hello_interval: Duration,
    pub dead_interval: Duration,
    pub priority: u8,
    /// Routers whose hellos the sender has seen on this segment.
    pub neighbors: Vec<RouterId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsUpdate {
    pub router_id: RouterId,
    pub area: AreaId,
    pub lsas: Vec<Lsa>,
}

/// A packet received on one local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub intf: IntfKey,
    /// Area the receiving interface belongs to.
    pub area: AreaId,
    pub source: Ipv4Addr,
    pub packet: OspfPacket,
}
