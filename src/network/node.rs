use std::{
    collections::BTreeSet,
    fmt::Display,
    net::Ipv4Addr,
};

use serde::{Deserialize, Serialize};

use crate::network::{
    edge::Edge,
    router::{AreaId, RouterId},
};

/// What an area graph vertex stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VertexKind {
    Router,
    Network,
}

/// Identity of one vertex of an area graph, one per originating LSA.
///
/// Router vertices are keyed by router id, network vertices by the link-state
/// id of their Network-LSA (the designated router's interface address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexKey {
    pub kind: VertexKind,
    pub id: Ipv4Addr,
    pub area: AreaId,
}

impl VertexKey {
    pub fn router(id: RouterId, area: AreaId) -> Self {
        Self {
            kind: VertexKind::Router,
            id: id.addr(),
            area,
        }
    }

    pub fn network(designated_router: Ipv4Addr, area: AreaId) -> Self {
        Self {
            kind: VertexKind::Network,
            id: designated_router,
            area,
        }
    }

    pub fn is_router(&self) -> bool {
        self.kind == VertexKind::Router
    }

    pub fn is_network(&self) -> bool {
        self.kind == VertexKind::Network
    }

    pub fn router_id(&self) -> Option<RouterId> {
        self.is_router().then_some(RouterId(self.id))
    }
}

impl Display for VertexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            VertexKind::Router => "router",
            VertexKind::Network => "network",
        };
        write!(f, "{kind} {} [area {}]", self.id, self.area)
    }
}

/// A vertex together with its outgoing edges. This is the input view of SPF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub key: VertexKey,
    pub edges: Vec<Edge>,
}

impl Vertex {
    pub fn new(key: VertexKey, mut edges: Vec<Edge>) -> Self {
        edges.sort();
        Self { key, edges }
    }
}

impl Display for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.key)?;
        for edge in &self.edges {
            writeln!(f, "  -> {} metric {} ({})", edge.destination, edge.metric, edge.kind)?;
        }
        Ok(())
    }
}

/// Where to send traffic: out of `interface`, towards `gateway`.
/// A gateway of `0.0.0.0` means the destination is directly connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextHop {
    pub interface: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl NextHop {
    pub fn new(interface: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self { interface, gateway }
    }

    pub fn connected(interface: Ipv4Addr) -> Self {
        Self::new(interface, Ipv4Addr::UNSPECIFIED)
    }

    pub fn is_connected(&self) -> bool {
        self.gateway.is_unspecified()
    }
}

impl Display for NextHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_connected() {
            write!(f, "connected via {}", self.interface)
        } else {
            write!(f, "via {} dev {}", self.gateway, self.interface)
        }
    }
}

/// SPF output for one reachable vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeVertex {
    pub key: VertexKey,
    pub distance: u32,
    /// Every parent on an equal-cost shortest path. Empty for the root.
    pub parents: BTreeSet<VertexKey>,
    /// Empty for the root.
    pub next_hops: BTreeSet<NextHop>,
}

impl TreeVertex {
    pub fn root(key: VertexKey) -> Self {
        Self {
            key,
            distance: 0,
            parents: BTreeSet::new(),
            next_hops: BTreeSet::new(),
        }
    }
}
