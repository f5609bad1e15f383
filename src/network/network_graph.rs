use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
};

use petgraph::{
    Direction,
    dot::Dot,
    graph::NodeIndex,
    stable_graph::StableDiGraph,
};
use thiserror::Error;
use tracing::debug;

use crate::{
    network::{
        edge::{Edge, EdgeKind},
        lsa::{NetworkLsa, RouterLinkType, RouterLsa},
        node::{Vertex, VertexKey},
        router::{AreaId, RouterId},
    },
    topology::store::AreaLsdb,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("{from} references {to}, which has no LSA in the database")]
    DanglingReference { from: VertexKey, to: VertexKey },
}

/// Directed, weighted topology of one area, derived from its LSDB.
///
/// Builds one vertex per Router-/Network-LSA and one edge per advertised link
/// or attached router. key_to_index_map maps vertex keys to graph indices so
/// incremental updates can find the vertex an LSA stands for.
#[derive(Debug, Clone)]
pub struct AreaGraph {
    pub area: AreaId,
    graph: StableDiGraph<VertexKey, Edge>,
    key_to_index_map: HashMap<VertexKey, NodeIndex>,
}

impl AreaGraph {
    pub fn new(area: AreaId) -> Self {
        Self {
            area,
            graph: StableDiGraph::new(),
            key_to_index_map: HashMap::new(),
        }
    }

    /// Full rebuild from the area's LSDB. Links towards vertices that have no
    /// LSA are dropped and reported, the rest of the area is still built.
    pub fn build(lsdb: &AreaLsdb) -> (Self, Vec<GraphError>) {
        let area = lsdb.area;
        let mut area_graph = Self::new(area);

        for lsa in lsdb.router_lsas() {
            area_graph.add_vertex(VertexKey::router(lsa.header.advertising_router, area));
        }
        for lsa in lsdb.network_lsas() {
            area_graph.add_vertex(VertexKey::network(lsa.designated_router(), area));
        }

        // Collect first so the immutable walk over the LSDB does not overlap
        // the mutable edge insertion.
        let mut edges_to_add = Vec::new();
        for lsa in lsdb.router_lsas() {
            edges_to_add.extend(router_lsa_edges(lsa, area));
        }
        for lsa in lsdb.network_lsas() {
            edges_to_add.extend(network_lsa_edges(lsa, area));
        }

        let dangling = area_graph.add_edges(edges_to_add);
        debug!(
            area = %area,
            vertices = area_graph.vertex_count(),
            edges = area_graph.edge_count(),
            dangling = dangling.len(),
            "area graph rebuilt"
        );
        (area_graph, dangling)
    }

    /// Re-derives the vertex of one Router-LSA after it changed in `lsdb`.
    pub fn update_router_lsa(&mut self, lsdb: &AreaLsdb, router: RouterId) -> Vec<GraphError> {
        let key = VertexKey::router(router, self.area);
        let outgoing = lsdb
            .router_lsa_of(router)
            .map(|lsa| router_lsa_edges(lsa, self.area));
        self.replace_vertex(lsdb, key, outgoing)
    }

    /// Re-derives the vertex of one Network-LSA after it changed in `lsdb`.
    pub fn update_network_lsa(&mut self, lsdb: &AreaLsdb, designated_router: Ipv4Addr) -> Vec<GraphError> {
        let key = VertexKey::network(designated_router, self.area);
        let outgoing = lsdb
            .find_network_lsa(designated_router)
            .map(|lsa| network_lsa_edges(lsa, self.area));
        self.replace_vertex(lsdb, key, outgoing)
    }

    /// Drops `key` with all its edges and, if the LSA still exists, re-adds it
    /// together with its own links and every link of another LSA pointing at it.
    fn replace_vertex(&mut self, lsdb: &AreaLsdb, key: VertexKey, outgoing: Option<Vec<Edge>>) -> Vec<GraphError> {
        if let Some(index) = self.key_to_index_map.remove(&key) {
            self.graph.remove_node(index);
        }
        let Some(outgoing) = outgoing else {
            debug!(vertex = %key, "vertex removed from area graph");
            return Vec::new();
        };
        self.add_vertex(key);

        let incoming: Vec<Edge> = lsdb
            .router_lsas()
            .flat_map(|lsa| router_lsa_edges(lsa, self.area))
            .chain(lsdb.network_lsas().flat_map(|lsa| network_lsa_edges(lsa, self.area)))
            .filter(|edge| edge.destination == key && edge.source != key)
            .collect();

        let mut dangling = self.add_edges(outgoing);
        dangling.extend(self.add_edges(incoming));
        debug!(vertex = %key, edges = self.edge_count(), "vertex updated in area graph");
        dangling
    }

    fn add_vertex(&mut self, key: VertexKey) -> NodeIndex {
        if let Some(index) = self.key_to_index_map.get(&key) {
            return *index;
        }
        let index = self.graph.add_node(key);
        self.key_to_index_map.insert(key, index);
        index
    }

    fn add_edges(&mut self, edges: Vec<Edge>) -> Vec<GraphError> {
        let mut dangling = Vec::new();
        for edge in edges {
            let (Some(&src), Some(&dst)) = (
                self.key_to_index_map.get(&edge.source),
                self.key_to_index_map.get(&edge.destination),
            ) else {
                debug!(from = %edge.source, to = %edge.destination, "dropping dangling link");
                dangling.push(GraphError::DanglingReference {
                    from: edge.source,
                    to: edge.destination,
                });
                continue;
            };
            self.graph.add_edge(src, dst, edge);
        }
        dangling
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, key: &VertexKey) -> bool {
        self.key_to_index_map.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &VertexKey> {
        self.key_to_index_map.keys()
    }

    /// Outgoing edges of `key`. Empty when the vertex does not exist.
    pub fn out_edges(&self, key: &VertexKey) -> Vec<&Edge> {
        match self.key_to_index_map.get(key) {
            Some(index) => self
                .graph
                .edges_directed(*index, Direction::Outgoing)
                .map(|edge| edge.weight())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn vertex(&self, key: &VertexKey) -> Option<Vertex> {
        self.contains(key)
            .then(|| Vertex::new(*key, self.out_edges(key).into_iter().cloned().collect()))
    }

    /// Ordered adjacency view of the whole graph, independent of node indices.
    pub fn snapshot(&self) -> BTreeMap<VertexKey, Vertex> {
        self.key_to_index_map
            .keys()
            .filter_map(|key| self.vertex(key).map(|vertex| (*key, vertex)))
            .collect()
    }

    /// Graphviz rendering of the area graph.
    pub fn dump_dot(&self) -> String {
        format!("{}", Dot::new(&self.graph))
    }

    pub fn dump_vertex(&self, key: &VertexKey) -> Option<String> {
        self.vertex(key).map(|vertex| vertex.to_string())
    }
}

/// Edges advertised by one Router-LSA.
fn router_lsa_edges(lsa: &RouterLsa, area: AreaId) -> Vec<Edge> {
    let source = VertexKey::router(lsa.header.advertising_router, area);
    lsa.links
        .iter()
        .filter_map(|link| match link.link_type {
            RouterLinkType::PointToPoint => Some(Edge::new(
                source,
                VertexKey::router(RouterId(link.link_id), area),
                link.metric as u32,
                EdgeKind::PointToPoint,
                link.link_data,
            )),
            RouterLinkType::Transit => Some(Edge::new(
                source,
                VertexKey::network(link.link_id, area),
                link.metric as u32,
                EdgeKind::RouterToNetwork,
                link.link_data,
            )),
            // Stub networks are leaves, consumed by route calculation.
            RouterLinkType::Stub => None,
            RouterLinkType::Virtual => {
                debug!(router = %lsa.header.advertising_router, "ignoring virtual link");
                None
            }
        })
        .collect()
}

fn network_lsa_edges(lsa: &NetworkLsa, area: AreaId) -> Vec<Edge> {
    let source = VertexKey::network(lsa.designated_router(), area);
    lsa.attached_routers
        .iter()
        .map(|router| Edge::network_to_router(source, VertexKey::router(*router, area)))
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        network::lsa::{INITIAL_SEQUENCE_NUMBER, RouterLink, RouterLsaFlags},
        topology::store::Lsdb,
    };

    const AREA: AreaId = AreaId::BACKBONE;
    const R1: RouterId = RouterId::new(1, 1, 1, 1);
    const R2: RouterId = RouterId::new(2, 2, 2, 2);
    const R3: RouterId = RouterId::new(3, 3, 3, 3);

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn mask() -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    /// R1 and R2 on the 10.0.0.0/24 segment (DR 10.0.0.2), R2 to R3 over a
    /// point-to-point link with asymmetric metrics.
    fn populated_lsdb() -> Lsdb {
        let mut lsdb = Lsdb::default();
        lsdb.init_ls_database(AREA);
        let seq = INITIAL_SEQUENCE_NUMBER;
        let flags = RouterLsaFlags::default();
        lsdb.upsert_router_lsa(AREA, RouterLsa::new(R1, seq, flags, vec![RouterLink::transit(addr(2), addr(1), 10)]))
            .unwrap();
        lsdb.upsert_router_lsa(
            AREA,
            RouterLsa::new(
                R2,
                seq,
                flags,
                vec![
                    RouterLink::transit(addr(2), addr(2), 5),
                    RouterLink::point_to_point(R3, Ipv4Addr::new(10, 1, 0, 1), 7),
                    RouterLink::stub(Ipv4Addr::new(10, 1, 0, 0), Ipv4Addr::new(255, 255, 255, 252), 7),
                ],
            ),
        )
        .unwrap();
        lsdb.upsert_router_lsa(
            AREA,
            RouterLsa::new(R3, seq, flags, vec![RouterLink::point_to_point(R2, Ipv4Addr::new(10, 1, 0, 2), 3)]),
        )
        .unwrap();
        lsdb.upsert_network_lsa(AREA, NetworkLsa::new(addr(2), R2, seq, mask(), vec![R1, R2]))
            .unwrap();
        lsdb
    }

    #[test]
    fn test_build_creates_vertices_and_weighted_edges() {
        let lsdb = populated_lsdb();
        let (graph, dangling) = AreaGraph::build(lsdb.area(AREA).unwrap());

        assert!(dangling.is_empty());
        assert_eq!(graph.vertex_count(), 4);
        // R1->N, R2->N, R2->R3, R3->R2, N->R1, N->R2
        assert_eq!(graph.edge_count(), 6);

        let net = VertexKey::network(addr(2), AREA);
        let r2_out = graph.out_edges(&VertexKey::router(R2, AREA));
        assert!(r2_out.iter().any(|e| e.destination == net && e.metric == 5));
        assert!(
            graph
                .out_edges(&net)
                .iter()
                .all(|e| e.metric == 0 && e.kind == EdgeKind::NetworkToRouter)
        );

        // Asymmetric point-to-point costs survive.
        let r3 = VertexKey::router(R3, AREA);
        let r2 = VertexKey::router(R2, AREA);
        assert_eq!(graph.out_edges(&r3)[0].metric, 3);
        assert!(graph.out_edges(&r2).iter().any(|e| e.destination == r3 && e.metric == 7));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let lsdb = populated_lsdb();
        let (first, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        let (second, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn test_dangling_reference_is_dropped() {
        let mut lsdb = Lsdb::default();
        lsdb.init_ls_database(AREA);
        lsdb.upsert_router_lsa(
            AREA,
            RouterLsa::new(
                R1,
                INITIAL_SEQUENCE_NUMBER,
                RouterLsaFlags::default(),
                vec![RouterLink::point_to_point(R2, addr(1), 1), RouterLink::transit(addr(9), addr(1), 1)],
            ),
        )
        .unwrap();

        let (graph, dangling) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(graph.vertex_count(), 1);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(dangling.len(), 2);
    }

    #[test]
    fn test_incremental_update_matches_rebuild() {
        let mut lsdb = Lsdb::default();
        lsdb.init_ls_database(AREA);
        let seq = INITIAL_SEQUENCE_NUMBER;
        let flags = RouterLsaFlags::default();
        lsdb.upsert_router_lsa(AREA, RouterLsa::new(R1, seq, flags, vec![RouterLink::transit(addr(2), addr(1), 10)]))
            .unwrap();
        let (mut graph, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(graph.edge_count(), 0);

        // The Network-LSA arrives: the dangling R1->N link must come back.
        lsdb.upsert_network_lsa(AREA, NetworkLsa::new(addr(2), R2, seq, mask(), vec![R1, R2]))
            .unwrap();
        graph.update_network_lsa(lsdb.area(AREA).unwrap(), addr(2));
        let (rebuilt, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(graph.snapshot(), rebuilt.snapshot());
        assert_eq!(graph.edge_count(), 2);

        // R2 appears.
        lsdb.upsert_router_lsa(AREA, RouterLsa::new(R2, seq, flags, vec![RouterLink::transit(addr(2), addr(2), 4)]))
            .unwrap();
        graph.update_router_lsa(lsdb.area(AREA).unwrap(), R2);
        let (rebuilt, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(graph.snapshot(), rebuilt.snapshot());

        // R1 changes its metric.
        lsdb.upsert_router_lsa(
            AREA,
            RouterLsa::new(R1, seq + 1, flags, vec![RouterLink::transit(addr(2), addr(1), 20)]),
        )
        .unwrap();
        graph.update_router_lsa(lsdb.area(AREA).unwrap(), R1);
        let (rebuilt, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(graph.snapshot(), rebuilt.snapshot());
    }

    #[test]
    fn test_incremental_update_removes_flushed_vertex() {
        let mut lsdb = populated_lsdb();
        let (mut graph, _) = AreaGraph::build(lsdb.area(AREA).unwrap());

        let mut flush = lsdb.area(AREA).unwrap().router_lsa_of(R3).unwrap().clone();
        flush.header.sequence_number += 1;
        flush.header.age = crate::network::lsa::MAX_AGE;
        lsdb.upsert_router_lsa(AREA, flush).unwrap();

        graph.update_router_lsa(lsdb.area(AREA).unwrap(), R3);
        let (rebuilt, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        assert_eq!(graph.snapshot(), rebuilt.snapshot());
        assert!(!graph.contains(&VertexKey::router(R3, AREA)));
    }

    #[test]
    fn test_dumps_are_read_only_renderings() {
        let lsdb = populated_lsdb();
        let (graph, _) = AreaGraph::build(lsdb.area(AREA).unwrap());
        let before = graph.snapshot();

        let dot = graph.dump_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("router 1.1.1.1"));

        let vertex = graph.dump_vertex(&VertexKey::router(R3, AREA)).unwrap();
        assert!(vertex.contains("router 2.2.2.2"));
        assert_eq!(graph.snapshot(), before);
    }
}
