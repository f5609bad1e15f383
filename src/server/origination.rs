/*!
Self-originated LSAs.

Pure builders used by the control loop: the Router-LSA describing this
router's links in one area, the Network-LSA of a segment this router is DR
for, and MaxAge copies used to flush LSAs we no longer stand behind.
*/

use std::net::Ipv4Addr;

use crate::{
    config::{IntfConf, IntfType},
    network::{
        lsa::{LinkStateAdvertisement, Lsa, MAX_AGE, MAX_SEQUENCE_NUMBER, NetworkLsa, RouterLink, RouterLsa, RouterLsaFlags},
        router::{AreaId, IntfKey, RouterId},
    },
    server::events::NeighborChange,
    topology::store::next_sequence_number,
};

/// A Full adjacency as cached by the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjacency {
    pub intf: IntfKey,
    pub area: AreaId,
    pub router_id: RouterId,
    pub address: Ipv4Addr,
    pub priority: u8,
}

impl From<&NeighborChange> for Adjacency {
    fn from(change: &NeighborChange) -> Self {
        Self {
            intf: change.intf,
            area: change.area,
            router_id: change.router_id,
            address: change.address,
            priority: change.priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesignatedRouter {
    pub router_id: RouterId,
    pub address: Ipv4Addr,
}

/// Highest (priority, router id) among this router and its Full neighbors on
/// the segment; priority 0 never becomes DR. `None` while the segment has no
/// adjacency.
pub fn elect_designated_router(
    self_id: RouterId,
    conf: &IntfConf,
    adjacencies: &[&Adjacency],
) -> Option<DesignatedRouter> {
    if adjacencies.is_empty() {
        return None;
    }
    let local = (conf.priority > 0).then_some((conf.priority, self_id, conf.key.ip_address));
    adjacencies
        .iter()
        .filter(|adj| adj.priority > 0)
        .map(|adj| (adj.priority, adj.router_id, adj.address))
        .chain(local)
        .max_by_key(|(priority, router_id, _)| (*priority, *router_id))
        .map(|(_, router_id, address)| DesignatedRouter { router_id, address })
}

fn stub_link(conf: &IntfConf) -> Option<RouterLink> {
    let network = conf.network().ok()?;
    Some(RouterLink::stub(network.network(), network.mask(), conf.metric()))
}

/// Links one interface contributes to the Router-LSA.
pub fn router_links(self_id: RouterId, conf: &IntfConf, adjacencies: &[&Adjacency]) -> Vec<RouterLink> {
    let local = conf.key.ip_address;
    match conf.intf_type {
        IntfType::PointToPoint => adjacencies
            .iter()
            .map(|adj| RouterLink::point_to_point(adj.router_id, local, conf.metric()))
            .chain(stub_link(conf))
            .collect(),
        IntfType::Broadcast => match elect_designated_router(self_id, conf, adjacencies) {
            Some(dr) => vec![RouterLink::transit(dr.address, local, conf.metric())],
            None => stub_link(conf).into_iter().collect(),
        },
    }
}

/// This router's Router-LSA for one area. `interfaces` are the running
/// interfaces of that area with their Full adjacencies.
pub fn build_router_lsa(
    self_id: RouterId,
    flags: RouterLsaFlags,
    interfaces: &[(&IntfConf, Vec<&Adjacency>)],
    previous: Option<i32>,
) -> RouterLsa {
    let links = interfaces
        .iter()
        .flat_map(|(conf, adjacencies)| router_links(self_id, conf, adjacencies))
        .collect();
    RouterLsa::new(self_id, next_sequence_number(previous), flags, links)
}

/// The Network-LSA of a broadcast segment, or `None` unless this router is its DR.
pub fn build_network_lsa(
    self_id: RouterId,
    conf: &IntfConf,
    adjacencies: &[&Adjacency],
    previous: Option<i32>,
) -> Option<NetworkLsa> {
    if conf.intf_type != IntfType::Broadcast {
        return None;
    }
    let dr = elect_designated_router(self_id, conf, adjacencies)?;
    if dr.router_id != self_id {
        return None;
    }
    let mut attached: Vec<RouterId> = adjacencies.iter().map(|adj| adj.router_id).collect();
    attached.push(self_id);
    attached.sort();
    attached.dedup();
    Some(NetworkLsa::new(
        conf.key.ip_address,
        self_id,
        next_sequence_number(previous),
        conf.mask(),
        attached,
    ))
}

/// True when two Router-LSAs advertise the same topology.
pub fn same_router_body(a: &RouterLsa, b: &RouterLsa) -> bool {
    a.flags == b.flags && a.links == b.links
}

pub fn same_network_body(a: &NetworkLsa, b: &NetworkLsa) -> bool {
    a.network_mask == b.network_mask && a.attached_routers == b.attached_routers
}

fn max_aged<T: LinkStateAdvertisement>(lsa: &T) -> T {
    let mut flushed = lsa.clone();
    let header = flushed.header_mut();
    header.age = MAX_AGE;
    // MaxAge alone makes a copy newer; at MaxSequenceNumber the number must not wrap.
    if header.sequence_number < MAX_SEQUENCE_NUMBER {
        header.sequence_number += 1;
    }
    flushed.refresh_checksum();
    flushed
}

/// A newer MaxAge instance of `lsa`; installing it removes the LSA everywhere.
pub fn flushed(lsa: &Lsa) -> Lsa {
    match lsa {
        Lsa::Router(lsa) => Lsa::Router(max_aged(lsa)),
        Lsa::Network(lsa) => Lsa::Network(max_aged(lsa)),
        Lsa::Summary(lsa) => Lsa::Summary(max_aged(lsa)),
        Lsa::AsExternal(lsa) => Lsa::AsExternal(max_aged(lsa)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::network::lsa::{INITIAL_SEQUENCE_NUMBER, RouterLinkType};

    const ME: RouterId = RouterId::new(1, 1, 1, 1);

    fn conf(intf_type: IntfType) -> IntfConf {
        let mut conf = IntfConf::new(IntfKey::new(Ipv4Addr::new(10, 0, 0, 1), 2), 24, AreaId::BACKBONE);
        conf.intf_type = intf_type;
        conf
    }

    fn adjacency(last: u8, priority: u8) -> Adjacency {
        Adjacency {
            intf: IntfKey::new(Ipv4Addr::new(10, 0, 0, 1), 2),
            area: AreaId::BACKBONE,
            router_id: RouterId::new(last, last, last, last),
            address: Ipv4Addr::new(10, 0, 0, last),
            priority,
        }
    }

    #[test]
    fn test_election_prefers_priority_then_router_id() {
        let conf = conf(IntfType::Broadcast);
        let low = adjacency(9, 1);
        let high = adjacency(2, 5);
        let dr = elect_designated_router(ME, &conf, &[&low, &high]).unwrap();
        assert_eq!(dr.router_id, RouterId::new(2, 2, 2, 2));
        assert_eq!(dr.address, Ipv4Addr::new(10, 0, 0, 2));

        let tie = adjacency(0, 1);
        let dr = elect_designated_router(ME, &conf, &[&tie]).unwrap();
        assert_eq!(dr.router_id, ME);
        assert_eq!(dr.address, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_priority_zero_never_wins() {
        let mut conf = conf(IntfType::Broadcast);
        conf.priority = 0;
        let ineligible = adjacency(2, 0);
        assert_eq!(elect_designated_router(ME, &conf, &[&ineligible]), None);
        assert_eq!(elect_designated_router(ME, &conf, &[]), None);
    }

    #[test]
    fn test_broadcast_links() {
        let conf = conf(IntfType::Broadcast);
        let alone = router_links(ME, &conf, &[]);
        assert_eq!(alone.len(), 1);
        assert_eq!(alone[0].link_type, RouterLinkType::Stub);
        assert_eq!(alone[0].link_id, Ipv4Addr::new(10, 0, 0, 0));

        let dr = adjacency(2, 1);
        let transit = router_links(ME, &conf, &[&dr]);
        assert_eq!(transit, vec![RouterLink::transit(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 10)]);
    }

    #[test]
    fn test_point_to_point_links() {
        let conf = conf(IntfType::PointToPoint);
        let peer = adjacency(2, 1);
        let links = router_links(ME, &conf, &[&peer]);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link_type, RouterLinkType::PointToPoint);
        assert_eq!(links[0].link_id, Ipv4Addr::new(2, 2, 2, 2));
        assert_eq!(links[1].link_type, RouterLinkType::Stub);
    }

    #[test]
    fn test_network_lsa_only_when_dr() {
        let conf = conf(IntfType::Broadcast);
        let lower = adjacency(0, 1);
        let lsa = build_network_lsa(ME, &conf, &[&lower], None).unwrap();
        assert_eq!(lsa.designated_router(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(lsa.attached_routers, vec![RouterId::new(0, 0, 0, 0), ME]);
        assert_eq!(lsa.header.sequence_number, INITIAL_SEQUENCE_NUMBER);

        let higher = adjacency(2, 1);
        assert_eq!(build_network_lsa(ME, &conf, &[&higher], None), None);
    }

    #[test]
    fn test_router_lsa_sequence_follows_previous() {
        let conf = conf(IntfType::Broadcast);
        let lsa = build_router_lsa(ME, RouterLsaFlags::default(), &[(&conf, vec![])], Some(INITIAL_SEQUENCE_NUMBER));
        assert_eq!(lsa.header.sequence_number, INITIAL_SEQUENCE_NUMBER + 1);
        assert_eq!(lsa.links.len(), 1);
    }

    #[test]
    fn test_flushed_is_newer_and_max_aged() {
        let conf = conf(IntfType::Broadcast);
        let lsa = Lsa::Router(build_router_lsa(ME, RouterLsaFlags::default(), &[(&conf, vec![])], None));
        let flushed = flushed(&lsa);
        assert_eq!(flushed.header().age, MAX_AGE);
        assert_eq!(flushed.header().sequence_number, INITIAL_SEQUENCE_NUMBER + 1);
        assert!(flushed.validate().is_ok());
    }

    #[test]
    fn test_flushed_keeps_max_sequence_number() {
        let conf = conf(IntfType::Broadcast);
        let lsa = build_router_lsa(ME, RouterLsaFlags::default(), &[(&conf, vec![])], Some(MAX_SEQUENCE_NUMBER - 1));
        assert_eq!(lsa.header.sequence_number, MAX_SEQUENCE_NUMBER);

        let flushed = flushed(&Lsa::Router(lsa.clone()));
        assert_eq!(flushed.header().age, MAX_AGE);
        assert_eq!(flushed.header().sequence_number, MAX_SEQUENCE_NUMBER);
        assert_eq!(flushed.header().checksum, lsa.header.checksum);
    }
}
