/*!
Shortest-path-first computation over one area graph.

Dijkstra runs in two passes. The first settles every reachable vertex and keeps
all equal-cost parents. The second walks the vertices in settle order, which
is a topological order of the parent relation, and derives next hops.
*/

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet},
    net::Ipv4Addr,
};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::network::{
    edge::EdgeKind,
    network_graph::AreaGraph,
    node::{NextHop, TreeVertex, VertexKey},
    router::{AreaId, RouterId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpfError {
    #[error("no graph for area {0}")]
    UnknownArea(AreaId),
    #[error("root {root} is not in the graph of area {area}")]
    RootNotInGraph { root: RouterId, area: AreaId },
}

/// Result of one SPF run. A vertex absent from the tree is unreachable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpfTree {
    root: Option<VertexKey>,
    vertices: BTreeMap<VertexKey, TreeVertex>,
}

impl SpfTree {
    pub fn root(&self) -> Option<&VertexKey> {
        self.root.as_ref()
    }

    pub fn get(&self, key: &VertexKey) -> Option<&TreeVertex> {
        self.vertices.get(key)
    }

    pub fn distance(&self, key: &VertexKey) -> Option<u32> {
        self.vertices.get(key).map(|v| v.distance)
    }

    pub fn contains(&self, key: &VertexKey) -> bool {
        self.vertices.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeVertex> {
        self.vertices.values()
    }

    /// The tree vertex of `router`, if reachable.
    pub fn router(&self, router: RouterId, area: AreaId) -> Option<&TreeVertex> {
        self.vertices.get(&VertexKey::router(router, area))
    }
}

/// Computes shortest paths from `root` over `graph`.
///
/// Equal-cost parents are all retained and their next hops unioned. A root
/// that has no vertex in the graph yields `SpfError::RootNotInGraph`.
pub fn execute_dijkstra(graph: &AreaGraph, root: RouterId) -> Result<SpfTree, SpfError> {
    let root_key = VertexKey::router(root, graph.area);
    if !graph.contains(&root_key) {
        return Err(SpfError::RootNotInGraph { root, area: graph.area });
    }

    let mut distances: HashMap<VertexKey, u32> = HashMap::new();
    let mut parents: HashMap<VertexKey, BTreeSet<VertexKey>> = HashMap::new();
    let mut settled: HashSet<VertexKey> = HashSet::new();
    let mut settle_order: Vec<VertexKey> = Vec::new();
    let mut heap = BinaryHeap::new();

    distances.insert(root_key, 0);
    heap.push(Reverse((0u32, root_key)));

    while let Some(Reverse((distance, key))) = heap.pop() {
        if !settled.insert(key) {
            continue;
        }
        settle_order.push(key);

        for edge in graph.out_edges(&key) {
            let next = edge.destination;
            // Parents are only ever added to unsettled vertices, which keeps
            // the parent relation acyclic even with zero-cost edges.
            if settled.contains(&next) || !graph.contains(&next) {
                continue;
            }
            let candidate = distance.saturating_add(edge.metric);
            match distances.get(&next) {
                Some(&known) if candidate > known => {}
                Some(&known) if candidate == known => {
                    parents.entry(next).or_default().insert(key);
                }
                _ => {
                    distances.insert(next, candidate);
                    parents.insert(next, BTreeSet::from([key]));
                    heap.push(Reverse((candidate, next)));
                }
            }
        }
    }

    let mut vertices: BTreeMap<VertexKey, TreeVertex> = BTreeMap::new();
    for key in settle_order {
        if key == root_key {
            vertices.insert(key, TreeVertex::root(key));
            continue;
        }
        let distance = distances.get(&key).copied().unwrap_or_default();
        let vertex_parents = parents.remove(&key).unwrap_or_default();
        let mut next_hops = BTreeSet::new();
        for parent in &vertex_parents {
            next_hops.extend(next_hops_via(graph, &vertices, &root_key, parent, &key, distance));
        }
        vertices.insert(
            key,
            TreeVertex {
                key,
                distance,
                parents: vertex_parents,
                next_hops,
            },
        );
    }

    debug!(area = %graph.area, root = %root, reachable = vertices.len(), "SPF finished");
    Ok(SpfTree {
        root: Some(root_key),
        vertices,
    })
}

/// Next hops towards `key` through one of its shortest-path parents.
fn next_hops_via(
    graph: &AreaGraph,
    done: &BTreeMap<VertexKey, TreeVertex>,
    root: &VertexKey,
    parent: &VertexKey,
    key: &VertexKey,
    distance: u32,
) -> Vec<NextHop> {
    if parent == root {
        return graph
            .out_edges(root)
            .into_iter()
            .filter(|edge| edge.destination == *key && edge.metric == distance)
            .map(|edge| match edge.kind {
                EdgeKind::PointToPoint => NextHop::new(edge.link_data, reciprocal_address(graph, key, root)),
                // A directly attached segment is reached through its designated
                // router, unless we are the DR ourselves.
                _ if key.id == edge.link_data => NextHop::connected(edge.link_data),
                _ => NextHop::new(edge.link_data, key.id),
            })
            .collect();
    }

    let Some(parent_vertex) = done.get(parent) else {
        return Vec::new();
    };

    if parent.is_network() && parent_vertex.parents.contains(root) {
        // Router on a segment the root is attached to: hops over the root's
        // own link to the segment go straight to the router's address there.
        // Hops the segment inherited from other parents stay as they are.
        let gateway = interface_towards(graph, key, parent).unwrap_or(key.id);
        let direct = next_hops_via(graph, done, root, root, parent, parent_vertex.distance);
        let mut hops: Vec<NextHop> = direct
            .iter()
            .map(|hop| NextHop::new(hop.interface, gateway))
            .collect();
        hops.extend(
            parent_vertex
                .next_hops
                .iter()
                .filter(|hop| !direct.contains(hop))
                .copied(),
        );
        return hops;
    }

    parent_vertex.next_hops.iter().copied().collect()
}

/// The address `router` uses on its point-to-point link back to `peer`,
/// falling back to its router id.
fn reciprocal_address(graph: &AreaGraph, router: &VertexKey, peer: &VertexKey) -> Ipv4Addr {
    graph
        .out_edges(router)
        .into_iter()
        .find(|edge| edge.destination == *peer && edge.kind == EdgeKind::PointToPoint)
        .map(|edge| edge.link_data)
        .unwrap_or(router.id)
}

/// The interface address `router` advertises on its transit link to `network`.
fn interface_towards(graph: &AreaGraph, router: &VertexKey, network: &VertexKey) -> Option<Ipv4Addr> {
    graph
        .out_edges(router)
        .into_iter()
        .find(|edge| edge.destination == *network && edge.kind == EdgeKind::RouterToNetwork)
        .map(|edge| edge.link_data)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        network::lsa::{INITIAL_SEQUENCE_NUMBER, NetworkLsa, RouterLink, RouterLsa, RouterLsaFlags},
        topology::store::Lsdb,
    };

    const AREA: AreaId = AreaId::new(0, 0, 0, 1);

    fn rid(n: u8) -> RouterId {
        RouterId::new(n, n, n, n)
    }

    fn p2p_addr(a: u8, b: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, a, b)
    }

    fn graph_of(lsas: Vec<RouterLsa>, networks: Vec<NetworkLsa>) -> AreaGraph {
        let mut lsdb = Lsdb::default();
        lsdb.init_ls_database(AREA);
        for lsa in lsas {
            lsdb.upsert_router_lsa(AREA, lsa).unwrap();
        }
        for lsa in networks {
            lsdb.upsert_network_lsa(AREA, lsa).unwrap();
        }
        AreaGraph::build(lsdb.area(AREA).unwrap()).0
    }

    fn router(n: u8, links: Vec<RouterLink>) -> RouterLsa {
        RouterLsa::new(rid(n), INITIAL_SEQUENCE_NUMBER, RouterLsaFlags::default(), links)
    }

    /// Point-to-point link from `a` to `b` numbered 192.168.<a*10+b>.<a>.
    fn p2p(a: u8, b: u8, metric: u16) -> RouterLink {
        let subnet = a.min(b) * 10 + a.max(b);
        RouterLink::point_to_point(rid(b), p2p_addr(subnet, a), metric)
    }

    #[test]
    fn test_root_has_distance_zero_and_unreachable_vertices_are_absent() {
        // R9 points at R1 but nothing points back at R9.
        let graph = graph_of(
            vec![
                router(1, vec![p2p(1, 2, 4)]),
                router(2, vec![p2p(2, 1, 4)]),
                router(9, vec![p2p(9, 1, 1)]),
            ],
            vec![],
        );
        let tree = execute_dijkstra(&graph, rid(1)).unwrap();

        let root = tree.router(rid(1), AREA).unwrap();
        assert_eq!(root.distance, 0);
        assert!(root.next_hops.is_empty());
        assert_eq!(tree.router(rid(2), AREA).unwrap().distance, 4);
        assert!(tree.router(rid(9), AREA).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_equal_cost_parents_are_both_kept() {
        //      R2
        //    /    \
        //  R1      R4
        //    \    /
        //      R3
        let graph = graph_of(
            vec![
                router(1, vec![p2p(1, 2, 1), p2p(1, 3, 1)]),
                router(2, vec![p2p(2, 1, 1), p2p(2, 4, 1)]),
                router(3, vec![p2p(3, 1, 1), p2p(3, 4, 1)]),
                router(4, vec![p2p(4, 2, 1), p2p(4, 3, 1)]),
            ],
            vec![],
        );
        let tree = execute_dijkstra(&graph, rid(1)).unwrap();

        let r4 = tree.router(rid(4), AREA).unwrap();
        assert_eq!(r4.distance, 2);
        assert_eq!(
            r4.parents,
            BTreeSet::from([VertexKey::router(rid(2), AREA), VertexKey::router(rid(3), AREA)])
        );
        assert_eq!(
            r4.next_hops,
            BTreeSet::from([
                NextHop::new(p2p_addr(12, 1), p2p_addr(12, 2)),
                NextHop::new(p2p_addr(13, 1), p2p_addr(13, 3)),
            ])
        );
    }

    #[test]
    fn test_shorter_path_wins_over_direct_link() {
        let graph = graph_of(
            vec![
                router(1, vec![p2p(1, 2, 1), p2p(1, 3, 10)]),
                router(2, vec![p2p(2, 1, 1), p2p(2, 3, 1)]),
                router(3, vec![p2p(3, 1, 10), p2p(3, 2, 1)]),
            ],
            vec![],
        );
        let tree = execute_dijkstra(&graph, rid(1)).unwrap();

        let r3 = tree.router(rid(3), AREA).unwrap();
        assert_eq!(r3.distance, 2);
        assert_eq!(r3.parents, BTreeSet::from([VertexKey::router(rid(2), AREA)]));
        assert_eq!(r3.next_hops, BTreeSet::from([NextHop::new(p2p_addr(12, 1), p2p_addr(12, 2))]));
    }

    #[test]
    fn test_transit_network_next_hops() {
        // R1 (10.0.0.1) and R2 (10.0.0.2, DR) share 10.0.0.0/24; R2 reaches R3 over p2p.
        let lan = |last| Ipv4Addr::new(10, 0, 0, last);
        let graph = graph_of(
            vec![
                router(1, vec![RouterLink::transit(lan(2), lan(1), 10)]),
                router(2, vec![RouterLink::transit(lan(2), lan(2), 10), p2p(2, 3, 5)]),
                router(3, vec![p2p(3, 2, 5)]),
            ],
            vec![NetworkLsa::new(
                lan(2),
                rid(2),
                INITIAL_SEQUENCE_NUMBER,
                Ipv4Addr::new(255, 255, 255, 0),
                vec![rid(1), rid(2)],
            )],
        );
        let tree = execute_dijkstra(&graph, rid(1)).unwrap();

        let net = tree.get(&VertexKey::network(lan(2), AREA)).unwrap();
        assert_eq!(net.distance, 10);
        assert_eq!(net.next_hops, BTreeSet::from([NextHop::new(lan(1), lan(2))]));

        let r2 = tree.router(rid(2), AREA).unwrap();
        assert_eq!(r2.distance, 10);
        assert_eq!(r2.next_hops, BTreeSet::from([NextHop::new(lan(1), lan(2))]));

        let r3 = tree.router(rid(3), AREA).unwrap();
        assert_eq!(r3.distance, 15);
        assert_eq!(r3.next_hops, r2.next_hops);
    }

    #[test]
    fn test_segment_router_keeps_hops_inherited_through_other_parents() {
        // R1 reaches the 10.0.0.0/24 segment (DR R2) directly at cost 10, and
        // through R3 at 5 + 5.
        let lan = |last| Ipv4Addr::new(10, 0, 0, last);
        let graph = graph_of(
            vec![
                router(1, vec![RouterLink::transit(lan(2), lan(1), 10), p2p(1, 3, 5)]),
                router(2, vec![RouterLink::transit(lan(2), lan(2), 10)]),
                router(3, vec![p2p(3, 1, 5), RouterLink::transit(lan(2), lan(3), 5)]),
            ],
            vec![NetworkLsa::new(
                lan(2),
                rid(2),
                INITIAL_SEQUENCE_NUMBER,
                Ipv4Addr::new(255, 255, 255, 0),
                vec![rid(1), rid(2), rid(3)],
            )],
        );
        let tree = execute_dijkstra(&graph, rid(1)).unwrap();
        let via_r3 = NextHop::new(p2p_addr(13, 1), p2p_addr(13, 3));

        let net = tree.get(&VertexKey::network(lan(2), AREA)).unwrap();
        assert_eq!(net.distance, 10);
        assert_eq!(net.next_hops, BTreeSet::from([NextHop::new(lan(1), lan(2)), via_r3]));

        let r2 = tree.router(rid(2), AREA).unwrap();
        assert_eq!(r2.distance, 10);
        assert_eq!(r2.next_hops, BTreeSet::from([NextHop::new(lan(1), lan(2)), via_r3]));

        let r3 = tree.router(rid(3), AREA).unwrap();
        assert_eq!(r3.distance, 5);
        assert_eq!(r3.next_hops, BTreeSet::from([via_r3]));
    }

    #[test]
    fn test_designated_router_reaches_its_segment_directly() {
        let lan = |last| Ipv4Addr::new(10, 0, 0, last);
        let graph = graph_of(
            vec![
                router(1, vec![RouterLink::transit(lan(1), lan(1), 1)]),
                router(2, vec![RouterLink::transit(lan(1), lan(2), 1)]),
            ],
            vec![NetworkLsa::new(
                lan(1),
                rid(1),
                INITIAL_SEQUENCE_NUMBER,
                Ipv4Addr::new(255, 255, 255, 0),
                vec![rid(1), rid(2)],
            )],
        );
        let tree = execute_dijkstra(&graph, rid(1)).unwrap();

        let net = tree.get(&VertexKey::network(lan(1), AREA)).unwrap();
        assert_eq!(net.next_hops, BTreeSet::from([NextHop::connected(lan(1))]));
        let r2 = tree.router(rid(2), AREA).unwrap();
        assert_eq!(r2.next_hops, BTreeSet::from([NextHop::new(lan(1), lan(2))]));
    }

    #[test]
    fn test_missing_root_is_reported() {
        let graph = graph_of(vec![router(2, vec![])], vec![]);
        assert_eq!(
            execute_dijkstra(&graph, rid(1)),
            Err(SpfError::RootNotInGraph { root: rid(1), area: AREA })
        );
    }

    #[test]
    fn test_rerun_replaces_prior_result() {
        let graph = graph_of(
            vec![router(1, vec![p2p(1, 2, 3)]), router(2, vec![p2p(2, 1, 3)])],
            vec![],
        );
        let first = execute_dijkstra(&graph, rid(1)).unwrap();
        let second = execute_dijkstra(&graph, rid(1)).unwrap();
        assert_eq!(first, second);

        let from_r2 = execute_dijkstra(&graph, rid(2)).unwrap();
        assert_eq!(from_r2.root(), Some(&VertexKey::router(rid(2), AREA)));
        assert_eq!(from_r2.router(rid(2), AREA).unwrap().distance, 0);
    }
}
