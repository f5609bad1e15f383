use std::{fmt::Display, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::network::node::VertexKey;

/// One directed, weighted edge of an area graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub source: VertexKey,
    pub destination: VertexKey,
    pub metric: u32,
    pub kind: EdgeKind,
    /// Link data of the advertising router's link: its interface address for
    /// point-to-point and transit links. Unspecified for network-to-router edges.
    pub link_data: Ipv4Addr,
}

impl Edge {
    pub fn new(source: VertexKey, destination: VertexKey, metric: u32, kind: EdgeKind, link_data: Ipv4Addr) -> Self {
        Self {
            source,
            destination,
            metric,
            kind,
            link_data,
        }
    }

    /// Edges from a network vertex to its attached routers cost nothing.
    pub fn network_to_router(network: VertexKey, router: VertexKey) -> Self {
        Self::new(network, router, 0, EdgeKind::NetworkToRouter, Ipv4Addr::UNSPECIFIED)
    }
}

impl Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.metric, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Router to router over a point-to-point link
    PointToPoint,
    /// Router to the transit network it is attached to
    RouterToNetwork,
    /// Transit network to one of its attached routers
    NetworkToRouter,
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeKind::PointToPoint => "p2p",
            EdgeKind::RouterToNetwork => "transit",
            EdgeKind::NetworkToRouter => "attached",
        };
        f.write_str(s)
    }
}
