/*!
Global routing table.

`install_routing_tbl` turns every area's SPF tree, plus the summary and
AS-external LSAs, into route candidates. `consolidate_routing_tbl` keeps one
entry per prefix: the best route class wins first (intra-area, then
inter-area, then external type 1, then type 2), the lowest cost second, and
equal-cost candidates of the winning class have their next hops unioned.
*/

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Write as _,
    net::Ipv4Addr,
};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    network::{
        lsa::{ExternalMetricType, LS_INFINITY, RouterLinkType},
        node::{NextHop, VertexKey},
        router::{AreaId, RouterId},
    },
    topology::{spf::SpfTree, store::Lsdb},
};

/// Route classes in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RouteClass {
    IntraArea,
    InterArea,
    ExternalType1,
    ExternalType2,
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteClass::IntraArea => "intra-area",
            RouteClass::InterArea => "inter-area",
            RouteClass::ExternalType1 => "external-1",
            RouteClass::ExternalType2 => "external-2",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: Ipv4Network,
    pub class: RouteClass,
    /// Internal cost. For type-1 externals this includes the external metric.
    pub cost: u32,
    /// External metric of a type-2 external route, zero otherwise.
    pub type2_cost: u32,
    pub next_hops: BTreeSet<NextHop>,
    pub area: AreaId,
    pub advertising_router: RouterId,
}

impl RouteEntry {
    /// Lower is better.
    fn preference(&self) -> (RouteClass, u32, u32) {
        match self.class {
            RouteClass::ExternalType2 => (self.class, self.type2_cost, self.cost),
            _ => (self.class, self.cost, 0),
        }
    }

    /// Whether `other` describes the same forwarding state.
    fn same_forwarding(&self, other: &RouteEntry) -> bool {
        self.class == other.class
            && self.cost == other.cost
            && self.type2_cost == other.type2_cost
            && self.next_hops == other.next_hops
    }
}

/// Destination prefix to its single best route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRoutingTbl {
    routes: HashMap<Ipv4Network, RouteEntry>,
}

impl GlobalRoutingTbl {
    pub fn get(&self, prefix: &Ipv4Network) -> Option<&RouteEntry> {
        self.routes.get(prefix)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Entries ordered by prefix address, then prefix length.
    pub fn sorted(&self) -> Vec<&RouteEntry> {
        let mut entries: Vec<&RouteEntry> = self.routes.values().collect();
        entries.sort_by_key(|entry| (u32::from(entry.prefix.network()), entry.prefix.prefix()));
        entries
    }

    /// Brings the table in line with the updates of `applied`.
    pub fn record(&mut self, applied: &RouteDiff) {
        for route in &applied.withdrawals {
            self.routes.remove(&route.prefix);
        }
        for route in &applied.installs {
            self.routes.insert(route.prefix, route.clone());
        }
    }

    /// Human readable listing of the table. Does not touch the table.
    pub fn dump_global_routing_tbl(&self) -> String {
        let mut out = String::new();
        for entry in self.sorted() {
            let _ = write!(
                out,
                "{} {} cost {} area {} adv {}",
                entry.prefix, entry.class, entry.cost, entry.area, entry.advertising_router
            );
            if entry.class == RouteClass::ExternalType2 {
                let _ = write!(out, " e2 {}", entry.type2_cost);
            }
            for hop in &entry.next_hops {
                let _ = write!(out, " [{hop}]");
            }
            out.push('\n');
        }
        out
    }
}

/// What has to be pushed to the forwarding plane after a recomputation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub installs: Vec<RouteEntry>,
    pub withdrawals: Vec<RouteEntry>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.installs.is_empty() && self.withdrawals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.installs.len() + self.withdrawals.len()
    }
}

/// New or changed routes are installed; routes not reconfirmed are withdrawn.
pub fn diff_routing_tbl(old: &GlobalRoutingTbl, new: &GlobalRoutingTbl) -> RouteDiff {
    let mut diff = RouteDiff::default();
    for entry in new.sorted() {
        match old.get(&entry.prefix) {
            Some(previous) if previous.same_forwarding(entry) => {}
            _ => diff.installs.push(entry.clone()),
        }
    }
    for entry in old.sorted() {
        if new.get(&entry.prefix).is_none() {
            diff.withdrawals.push(entry.clone());
        }
    }
    diff
}

/// Everything route calculation reads.
pub struct RouteInputs<'a> {
    pub router_id: RouterId,
    pub lsdb: &'a Lsdb,
    pub trees: &'a BTreeMap<AreaId, SpfTree>,
    /// Areas configured not to import AS-external routes.
    pub stub_areas: &'a BTreeSet<AreaId>,
    /// Addresses of the local interfaces, used for directly connected stubs.
    pub local_networks: &'a [Ipv4Network],
}

/// Builds `prefix` from an address and a mask, with host bits cleared.
pub fn prefix_of(address: Ipv4Addr, mask: Ipv4Addr) -> Option<Ipv4Network> {
    let prefix_len = u32::from(mask).leading_ones() as u8;
    let network = Ipv4Addr::from(u32::from(address) & u32::from(mask));
    Ipv4Network::new(network, prefix_len).ok()
}

fn connected_hop(inputs: &RouteInputs<'_>, prefix: &Ipv4Network) -> NextHop {
    let interface = inputs
        .local_networks
        .iter()
        .find(|local| local.contains(prefix.network()))
        .map(|local| local.ip())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    NextHop::connected(interface)
}

/// Produces every route candidate from the current SPF trees and LSDB.
pub fn install_routing_tbl(inputs: &RouteInputs<'_>) -> Vec<RouteEntry> {
    let mut candidates = Vec::new();
    for (area, tree) in inputs.trees {
        intra_area_candidates(inputs, *area, tree, &mut candidates);
        inter_area_candidates(inputs, *area, tree, &mut candidates);
    }
    external_candidates(inputs, &mut candidates);
    candidates
}

fn intra_area_candidates(inputs: &RouteInputs<'_>, area: AreaId, tree: &SpfTree, out: &mut Vec<RouteEntry>) {
    let Some(lsdb) = inputs.lsdb.area(area) else {
        return;
    };
    let root = VertexKey::router(inputs.router_id, area);

    for vertex in tree.iter() {
        if vertex.key.is_network() {
            let Some(lsa) = lsdb.find_network_lsa(vertex.key.id) else {
                continue;
            };
            let Some(prefix) = prefix_of(lsa.header.link_state_id, lsa.network_mask) else {
                continue;
            };
            out.push(RouteEntry {
                prefix,
                class: RouteClass::IntraArea,
                cost: vertex.distance,
                type2_cost: 0,
                next_hops: vertex.next_hops.clone(),
                area,
                advertising_router: lsa.header.advertising_router,
            });
            continue;
        }

        let Some(router) = vertex.key.router_id() else {
            continue;
        };
        let Some(lsa) = lsdb.router_lsa_of(router) else {
            continue;
        };
        for link in lsa.links.iter().filter(|link| link.link_type == RouterLinkType::Stub) {
            let Some(prefix) = prefix_of(link.link_id, link.link_data) else {
                continue;
            };
            let next_hops = if vertex.key == root {
                BTreeSet::from([connected_hop(inputs, &prefix)])
            } else {
                vertex.next_hops.clone()
            };
            if next_hops.is_empty() {
                continue;
            }
            out.push(RouteEntry {
                prefix,
                class: RouteClass::IntraArea,
                cost: vertex.distance.saturating_add(link.metric as u32),
                type2_cost: 0,
                next_hops,
                area,
                advertising_router: router,
            });
        }
    }
}

fn inter_area_candidates(inputs: &RouteInputs<'_>, area: AreaId, tree: &SpfTree, out: &mut Vec<RouteEntry>) {
    let Some(lsdb) = inputs.lsdb.area(area) else {
        return;
    };
    for lsa in lsdb.summary_lsas() {
        let abr = lsa.header.advertising_router;
        if abr == inputs.router_id || lsa.metric >= LS_INFINITY {
            continue;
        }
        let Some(abr_vertex) = tree.router(abr, area) else {
            continue;
        };
        let Some(prefix) = prefix_of(lsa.header.link_state_id, lsa.network_mask) else {
            continue;
        };
        out.push(RouteEntry {
            prefix,
            class: RouteClass::InterArea,
            cost: abr_vertex.distance.saturating_add(lsa.metric),
            type2_cost: 0,
            next_hops: abr_vertex.next_hops.clone(),
            area,
            advertising_router: abr,
        });
    }
}

fn external_candidates(inputs: &RouteInputs<'_>, out: &mut Vec<RouteEntry>) {
    for lsa in inputs.lsdb.external_lsas() {
        let asbr = lsa.header.advertising_router;
        if asbr == inputs.router_id || lsa.metric >= LS_INFINITY {
            continue;
        }
        let Some(prefix) = prefix_of(lsa.header.link_state_id, lsa.network_mask) else {
            continue;
        };
        // The closest ASBR path over all areas that import externals.
        let best = inputs
            .trees
            .iter()
            .filter(|(area, _)| !inputs.stub_areas.contains(area))
            .filter_map(|(area, tree)| tree.router(asbr, *area).map(|vertex| (*area, vertex)))
            .min_by_key(|(_, vertex)| vertex.distance);
        let Some((area, asbr_vertex)) = best else {
            continue;
        };
        let (class, cost, type2_cost) = match lsa.metric_type {
            ExternalMetricType::Type1 => (
                RouteClass::ExternalType1,
                asbr_vertex.distance.saturating_add(lsa.metric),
                0,
            ),
            ExternalMetricType::Type2 => (RouteClass::ExternalType2, asbr_vertex.distance, lsa.metric),
        };
        out.push(RouteEntry {
            prefix,
            class,
            cost,
            type2_cost,
            next_hops: asbr_vertex.next_hops.clone(),
            area,
            advertising_router: asbr,
        });
    }
}

/// Keeps the preferred candidate per prefix, unioning the next hops of
/// equally preferred ones.
pub fn consolidate_routing_tbl(candidates: Vec<RouteEntry>) -> GlobalRoutingTbl {
    let mut routes: HashMap<Ipv4Network, RouteEntry> = HashMap::new();
    for candidate in candidates {
        match routes.get_mut(&candidate.prefix) {
            None => {
                routes.insert(candidate.prefix, candidate);
            }
            Some(current) => match candidate.preference().cmp(&current.preference()) {
                std::cmp::Ordering::Less => *current = candidate,
                std::cmp::Ordering::Equal => current.next_hops.extend(candidate.next_hops),
                std::cmp::Ordering::Greater => {}
            },
        }
    }
    debug!(routes = routes.len(), "routing table consolidated");
    GlobalRoutingTbl { routes }
}
