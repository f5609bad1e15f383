/*!
Already-decoded OSPFv2 LSA record shapes.

Wire decode happens outside this crate. The canonical encoding below exists only
so the LSA checksum can be recomputed whenever a stored record is mutated, and
so diagnostic dumps can show the body as hex.
*/

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::router::RouterId;

/// Age at which an LSA is flushed from the database (seconds).
pub const MAX_AGE: u16 = 3600;
/// Age at which a self-originated LSA is re-originated (seconds).
pub const LS_REFRESH_TIME: u16 = 1800;
/// Metric value meaning "unreachable" in summary and external LSAs.
pub const LS_INFINITY: u32 = 0x00FF_FFFF;
pub const INITIAL_SEQUENCE_NUMBER: i32 = 0x8000_0001_u32 as i32;
pub const MAX_SEQUENCE_NUMBER: i32 = 0x7FFF_FFFF;

const HEADER_LEN: usize = 20;
const CHECKSUM_OFFSET: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LsaError {
    #[error("LSA header type {found:?} does not match body type {expected:?}")]
    TypeMismatch { expected: LsaType, found: LsaType },
    #[error("router LSA link-state id {lsid} differs from advertising router {adv}")]
    RouterLsidMismatch { lsid: Ipv4Addr, adv: RouterId },
    #[error("non-contiguous network mask {0}")]
    InvalidMask(Ipv4Addr),
    #[error("network LSA {0} lists no attached routers")]
    NoAttachedRouters(Ipv4Addr),
    #[error("metric {0} exceeds LSInfinity")]
    MetricOutOfRange(u32),
    #[error("age {0} exceeds MaxAge")]
    AgeOutOfRange(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LsaType {
    Router = 1,
    Network = 2,
    Summary = 3,
    AsExternal = 5,
}

/// Common 20-byte LSA header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsaHeader {
    pub age: u16,
    pub options: u8,
    pub ls_type: LsaType,
    pub link_state_id: Ipv4Addr,
    pub advertising_router: RouterId,
    pub sequence_number: i32,
    pub checksum: u16,
}

impl LsaHeader {
    pub fn new(ls_type: LsaType, link_state_id: Ipv4Addr, advertising_router: RouterId, sequence_number: i32) -> Self {
        Self {
            age: 0,
            options: 0x02, // E-bit: AS-external capable
            ls_type,
            link_state_id,
            advertising_router,
            sequence_number,
            checksum: 0,
        }
    }

    pub fn key(&self) -> LsaKey {
        LsaKey {
            link_state_id: self.link_state_id,
            advertising_router: self.advertising_router,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>, length: u16) {
        buf.extend_from_slice(&self.age.to_be_bytes());
        buf.push(self.options);
        buf.push(self.ls_type as u8);
        buf.extend_from_slice(&self.link_state_id.octets());
        buf.extend_from_slice(&self.advertising_router.addr().octets());
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&length.to_be_bytes());
    }
}

/// Database key of an LSA within one type: (link-state id, advertising router).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LsaKey {
    pub link_state_id: Ipv4Addr,
    pub advertising_router: RouterId,
}

impl LsaKey {
    pub fn new(link_state_id: Ipv4Addr, advertising_router: RouterId) -> Self {
        Self {
            link_state_id,
            advertising_router,
        }
    }
}

impl std::fmt::Display for LsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.link_state_id, self.advertising_router)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RouterLinkType {
    PointToPoint = 1,
    Transit = 2,
    Stub = 3,
    Virtual = 4,
}

/// One link of a Router-LSA.
///
/// Meaning of `link_id`/`link_data` depends on the type:
/// - point-to-point: neighbor router id / local interface address
/// - transit: designated router interface address / local interface address
/// - stub: network number / network mask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterLink {
    pub link_type: RouterLinkType,
    pub link_id: Ipv4Addr,
    pub link_data: Ipv4Addr,
    pub metric: u16,
}

impl RouterLink {
    pub fn point_to_point(neighbor: RouterId, local_address: Ipv4Addr, metric: u16) -> Self {
        Self {
            link_type: RouterLinkType::PointToPoint,
            link_id: neighbor.addr(),
            link_data: local_address,
            metric,
        }
    }

    pub fn transit(designated_router: Ipv4Addr, local_address: Ipv4Addr, metric: u16) -> Self {
        Self {
            link_type: RouterLinkType::Transit,
            link_id: designated_router,
            link_data: local_address,
            metric,
        }
    }

    pub fn stub(network: Ipv4Addr, mask: Ipv4Addr, metric: u16) -> Self {
        Self {
            link_type: RouterLinkType::Stub,
            link_id: network,
            link_data: mask,
            metric,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouterLsaFlags {
    /// B-bit: area border router.
    pub border: bool,
    /// E-bit: AS boundary router.
    pub external: bool,
    /// V-bit: virtual link endpoint. Stored, never acted on.
    pub virtual_endpoint: bool,
}

impl RouterLsaFlags {
    fn bits(&self) -> u8 {
        (self.virtual_endpoint as u8) << 2 | (self.external as u8) << 1 | self.border as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterLsa {
    pub header: LsaHeader,
    pub flags: RouterLsaFlags,
    pub links: Vec<RouterLink>,
}

impl RouterLsa {
    pub fn new(router_id: RouterId, sequence_number: i32, flags: RouterLsaFlags, links: Vec<RouterLink>) -> Self {
        let mut lsa = Self {
            header: LsaHeader::new(LsaType::Router, router_id.addr(), router_id, sequence_number),
            flags,
            links,
        };
        lsa.refresh_checksum();
        lsa
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLsa {
    pub header: LsaHeader,
    pub network_mask: Ipv4Addr,
    pub attached_routers: Vec<RouterId>,
}

impl NetworkLsa {
    /// `designated_router` is the DR's interface address, which is also the link-state id.
    pub fn new(
        designated_router: Ipv4Addr,
        dr_router_id: RouterId,
        sequence_number: i32,
        network_mask: Ipv4Addr,
        attached_routers: Vec<RouterId>,
    ) -> Self {
        let mut lsa = Self {
            header: LsaHeader::new(LsaType::Network, designated_router, dr_router_id, sequence_number),
            network_mask,
            attached_routers,
        };
        lsa.refresh_checksum();
        lsa
    }

    pub fn designated_router(&self) -> Ipv4Addr {
        self.header.link_state_id
    }
}

/// Type-3 summary: an inter-area network advertised by an ABR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryLsa {
    pub header: LsaHeader,
    pub network_mask: Ipv4Addr,
    pub metric: u32,
}

impl SummaryLsa {
    pub fn new(network: Ipv4Addr, abr: RouterId, sequence_number: i32, network_mask: Ipv4Addr, metric: u32) -> Self {
        let mut lsa = Self {
            header: LsaHeader::new(LsaType::Summary, network, abr, sequence_number),
            network_mask,
            metric,
        };
        lsa.refresh_checksum();
        lsa
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExternalMetricType {
    /// E1: external metric is comparable with the internal cost.
    Type1,
    /// E2: external metric dominates the internal cost.
    Type2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsExternalLsa {
    pub header: LsaHeader,
    pub network_mask: Ipv4Addr,
    pub metric_type: ExternalMetricType,
    pub metric: u32,
    pub forwarding_address: Ipv4Addr,
    pub route_tag: u32,
}

impl AsExternalLsa {
    pub fn new(
        network: Ipv4Addr,
        asbr: RouterId,
        sequence_number: i32,
        network_mask: Ipv4Addr,
        metric_type: ExternalMetricType,
        metric: u32,
    ) -> Self {
        let mut lsa = Self {
            header: LsaHeader::new(LsaType::AsExternal, network, asbr, sequence_number),
            network_mask,
            metric_type,
            metric,
            forwarding_address: Ipv4Addr::UNSPECIFIED,
            route_tag: 0,
        };
        lsa.refresh_checksum();
        lsa
    }
}

/// Behaviour shared by every stored LSA kind.
pub trait LinkStateAdvertisement: Clone {
    const LS_TYPE: LsaType;

    fn header(&self) -> &LsaHeader;
    fn header_mut(&mut self) -> &mut LsaHeader;
    fn encode_body(&self, buf: &mut Vec<u8>);

    /// Structural checks on an already-decoded record.
    fn validate_body(&self) -> Result<(), LsaError> {
        Ok(())
    }

    fn key(&self) -> LsaKey {
        self.header().key()
    }

    fn validate(&self) -> Result<(), LsaError> {
        let header = self.header();
        if header.ls_type != Self::LS_TYPE {
            return Err(LsaError::TypeMismatch {
                expected: Self::LS_TYPE,
                found: header.ls_type,
            });
        }
        if header.age > MAX_AGE {
            return Err(LsaError::AgeOutOfRange(header.age));
        }
        self.validate_body()
    }

    /// Canonical big-endian encoding, header included.
    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        self.header().encode(&mut buf, (HEADER_LEN + body.len()) as u16);
        buf.extend_from_slice(&body);
        buf
    }

    fn compute_checksum(&self) -> u16 {
        let encoded = self.encode();
        // Age is excluded from the checksummed region.
        fletcher_checksum(&encoded[2..], CHECKSUM_OFFSET - 2)
    }

    fn refresh_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.header_mut().checksum = checksum;
    }
}

impl LinkStateAdvertisement for RouterLsa {
    const LS_TYPE: LsaType = LsaType::Router;

    fn header(&self) -> &LsaHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut LsaHeader {
        &mut self.header
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.push(self.flags.bits());
        buf.push(0);
        buf.extend_from_slice(&(self.links.len() as u16).to_be_bytes());
        for link in &self.links {
            buf.extend_from_slice(&link.link_id.octets());
            buf.extend_from_slice(&link.link_data.octets());
            buf.push(link.link_type as u8);
            buf.push(0); // no TOS metrics
            buf.extend_from_slice(&link.metric.to_be_bytes());
        }
    }

    fn validate_body(&self) -> Result<(), LsaError> {
        if self.header.link_state_id != self.header.advertising_router.addr() {
            return Err(LsaError::RouterLsidMismatch {
                lsid: self.header.link_state_id,
                adv: self.header.advertising_router,
            });
        }
        for link in &self.links {
            if link.link_type == RouterLinkType::Stub && !is_contiguous_mask(link.link_data) {
                return Err(LsaError::InvalidMask(link.link_data));
            }
        }
        Ok(())
    }
}

impl LinkStateAdvertisement for NetworkLsa {
    const LS_TYPE: LsaType = LsaType::Network;

    fn header(&self) -> &LsaHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut LsaHeader {
        &mut self.header
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.network_mask.octets());
        for router in &self.attached_routers {
            buf.extend_from_slice(&router.addr().octets());
        }
    }

    fn validate_body(&self) -> Result<(), LsaError> {
        if !is_contiguous_mask(self.network_mask) {
            return Err(LsaError::InvalidMask(self.network_mask));
        }
        if self.attached_routers.is_empty() {
            return Err(LsaError::NoAttachedRouters(self.header.link_state_id));
        }
        Ok(())
    }
}

impl LinkStateAdvertisement for SummaryLsa {
    const LS_TYPE: LsaType = LsaType::Summary;

    fn header(&self) -> &LsaHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut LsaHeader {
        &mut self.header
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.network_mask.octets());
        buf.push(0);
        buf.extend_from_slice(&self.metric.to_be_bytes()[1..]);
    }

    fn validate_body(&self) -> Result<(), LsaError> {
        if !is_contiguous_mask(self.network_mask) {
            return Err(LsaError::InvalidMask(self.network_mask));
        }
        if self.metric > LS_INFINITY {
            return Err(LsaError::MetricOutOfRange(self.metric));
        }
        Ok(())
    }
}

impl LinkStateAdvertisement for AsExternalLsa {
    const LS_TYPE: LsaType = LsaType::AsExternal;

    fn header(&self) -> &LsaHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut LsaHeader {
        &mut self.header
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.network_mask.octets());
        buf.push(match self.metric_type {
            ExternalMetricType::Type1 => 0,
            ExternalMetricType::Type2 => 0x80,
        });
        buf.extend_from_slice(&self.metric.to_be_bytes()[1..]);
        buf.extend_from_slice(&self.forwarding_address.octets());
        buf.extend_from_slice(&self.route_tag.to_be_bytes());
    }

    fn validate_body(&self) -> Result<(), LsaError> {
        if !is_contiguous_mask(self.network_mask) {
            return Err(LsaError::InvalidMask(self.network_mask));
        }
        if self.metric > LS_INFINITY {
            return Err(LsaError::MetricOutOfRange(self.metric));
        }
        Ok(())
    }
}

/// Any LSA as carried in a link-state update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lsa {
    Router(RouterLsa),
    Network(NetworkLsa),
    Summary(SummaryLsa),
    AsExternal(AsExternalLsa),
}

impl Lsa {
    pub fn header(&self) -> &LsaHeader {
        match self {
            Lsa::Router(lsa) => &lsa.header,
            Lsa::Network(lsa) => &lsa.header,
            Lsa::Summary(lsa) => &lsa.header,
            Lsa::AsExternal(lsa) => &lsa.header,
        }
    }

    pub fn validate(&self) -> Result<(), LsaError> {
        match self {
            Lsa::Router(lsa) => lsa.validate(),
            Lsa::Network(lsa) => lsa.validate(),
            Lsa::Summary(lsa) => lsa.validate(),
            Lsa::AsExternal(lsa) => lsa.validate(),
        }
    }
}

/// True when the mask is a run of ones followed by zeros.
pub fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

/// ISO 8473 Fletcher checksum as used by OSPF.
///
/// `offset` is the position of the two checksum bytes inside `data`; they are
/// treated as zero during the computation.
pub fn fletcher_checksum(data: &[u8], offset: usize) -> u16 {
    let mut c0: i64 = 0;
    let mut c1: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        let b = if i == offset || i == offset + 1 { 0 } else { *byte as i64 };
        c0 = (c0 + b) % 255;
        c1 = (c1 + c0) % 255;
    }

    let len = data.len() as i64;
    let mut x = ((len - offset as i64 - 1) * c0 - c1).rem_euclid(255);
    if x == 0 {
        x = 255;
    }
    let mut y = 510 - c0 - x;
    if y > 255 {
        y -= 255;
    }
    ((x as u16) << 8) | (y as u16 & 0xff)
}

/// Fletcher verification: a region containing a correct checksum sums to zero.
pub fn verify_checksum(data: &[u8]) -> bool {
    let mut c0: u32 = 0;
    let mut c1: u32 = 0;
    for byte in data {
        c0 = (c0 + *byte as u32) % 255;
        c1 = (c1 + c0) % 255;
    }
    c0 == 0 && c1 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_router_lsa() -> RouterLsa {
        RouterLsa::new(
            RouterId::new(1, 1, 1, 1),
            INITIAL_SEQUENCE_NUMBER,
            RouterLsaFlags::default(),
            vec![
                RouterLink::transit(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 10),
                RouterLink::stub(Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(255, 255, 255, 0), 1),
            ],
        )
    }

    #[test]
    fn test_checksum_verifies_over_encoded_lsa() {
        let lsa = sample_router_lsa();
        let encoded = lsa.encode();
        assert_ne!(lsa.header.checksum, 0);
        assert!(verify_checksum(&encoded[2..]));
    }

    #[test]
    fn test_checksum_ignores_age() {
        let mut lsa = sample_router_lsa();
        let before = lsa.compute_checksum();
        lsa.header.age = 1200;
        assert_eq!(lsa.compute_checksum(), before);
    }

    #[test]
    fn test_checksum_changes_with_body() {
        let mut lsa = sample_router_lsa();
        let before = lsa.header.checksum;
        lsa.links[0].metric = 20;
        lsa.refresh_checksum();
        assert_ne!(lsa.header.checksum, before);
        assert!(verify_checksum(&lsa.encode()[2..]));
    }

    #[test]
    fn test_router_lsa_validation() {
        let mut lsa = sample_router_lsa();
        assert!(lsa.validate().is_ok());

        lsa.header.link_state_id = Ipv4Addr::new(9, 9, 9, 9);
        assert!(matches!(lsa.validate(), Err(LsaError::RouterLsidMismatch { .. })));
    }

    #[test]
    fn test_network_lsa_requires_attached_routers() {
        let lsa = NetworkLsa::new(
            Ipv4Addr::new(10, 0, 0, 2),
            RouterId::new(2, 2, 2, 2),
            INITIAL_SEQUENCE_NUMBER,
            Ipv4Addr::new(255, 255, 255, 0),
            vec![],
        );
        assert_eq!(lsa.validate(), Err(LsaError::NoAttachedRouters(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn test_contiguous_mask() {
        assert!(is_contiguous_mask(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(is_contiguous_mask(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(is_contiguous_mask(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(!is_contiguous_mask(Ipv4Addr::new(255, 0, 255, 0)));
    }

    #[test]
    fn test_summary_metric_bound() {
        let lsa = SummaryLsa::new(
            Ipv4Addr::new(172, 16, 0, 0),
            RouterId::new(3, 3, 3, 3),
            INITIAL_SEQUENCE_NUMBER,
            Ipv4Addr::new(255, 255, 0, 0),
            LS_INFINITY + 1,
        );
        assert_eq!(lsa.validate(), Err(LsaError::MetricOutOfRange(LS_INFINITY + 1)));
    }
}
