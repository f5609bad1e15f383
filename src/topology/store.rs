/*!
Link-state database.

This module defines:
- `AreaLsdb`: the Router-, Network- and Summary-LSAs learned in one area, plus
  the dirty flags that tell the control loop what has to be recomputed.
- `Lsdb`: every area's database and the AS-wide AS-External-LSAs.

Updates are accepted only when they carry a strictly newer sequence number. A
stale or duplicate submission is rejected without touching the stored copy.
*/

use std::{collections::BTreeMap, net::Ipv4Addr};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::network::{
    lsa::{
        AsExternalLsa, INITIAL_SEQUENCE_NUMBER, LinkStateAdvertisement, LsaError, LsaHeader, LsaKey, LsaType,
        MAX_AGE, MAX_SEQUENCE_NUMBER, NetworkLsa, RouterLsa, SummaryLsa,
    },
    router::{AreaId, RouterId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LsdbError {
    #[error("malformed LSA {key}: {source}")]
    Malformed {
        key: LsaKey,
        #[source]
        source: LsaError,
    },
    #[error("stale LSA {key}: sequence {received:#010x} is not newer than {stored:#010x}")]
    Stale { key: LsaKey, stored: i32, received: i32 },
    #[error("inconsistent LSA {key}: stored checksum {stored:#06x}, received {received:#06x}")]
    Inconsistent { key: LsaKey, stored: u16, received: u16 },
    #[error("area {0} has no link-state database")]
    UnknownArea(AreaId),
    #[error("AS-external LSDB limit of {0} entries reached")]
    ExternalOverflow(i32),
}

/// What an accepted upsert did to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// A newer MaxAge instance removed the stored copy.
    Flushed,
    /// A MaxAge instance of an LSA we never had.
    Ignored,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, UpsertOutcome::Ignored)
    }
}

/// Returns the sequence number to originate after `current`.
///
/// An instance at `MAX_SEQUENCE_NUMBER` has to be flushed from the database
/// before the wrapped `INITIAL_SEQUENCE_NUMBER` instance is accepted.
pub fn next_sequence_number(current: Option<i32>) -> i32 {
    match current {
        Some(seq) if seq < MAX_SEQUENCE_NUMBER => seq + 1,
        _ => INITIAL_SEQUENCE_NUMBER,
    }
}

/// Logs and reports whether two checksums of the same LSA instance agree.
/// The database never repairs a mismatch; re-requesting is up to the caller.
fn checksums_consistent(area: Option<AreaId>, key: &LsaKey, old: u16, new: u16) -> bool {
    if old == new {
        return true;
    }
    warn!(
        area = ?area.map(|a| a.to_string()),
        lsa = %key,
        old = format_args!("{old:#06x}"),
        new = format_args!("{new:#06x}"),
        "LSA checksum mismatch"
    );
    false
}

fn upsert_into<K: Ord, L: LinkStateAdvertisement>(
    map: &mut BTreeMap<K, L>,
    map_key: K,
    mut lsa: L,
    area: Option<AreaId>,
) -> Result<UpsertOutcome, LsdbError> {
    let key = lsa.key();
    lsa.validate().map_err(|source| LsdbError::Malformed { key, source })?;
    lsa.refresh_checksum();

    let outcome = match map.get(&map_key) {
        Some(stored) => {
            let stored_header = stored.header();
            let received = lsa.header().sequence_number;
            if received == stored_header.sequence_number
                && !checksums_consistent(area, &key, stored_header.checksum, lsa.header().checksum)
            {
                return Err(LsdbError::Inconsistent {
                    key,
                    stored: stored_header.checksum,
                    received: lsa.header().checksum,
                });
            }
            // A MaxAge copy of the stored instance is newer than it.
            let premature_flush = received == stored_header.sequence_number
                && lsa.header().age >= MAX_AGE
                && stored_header.age < MAX_AGE;
            if received <= stored_header.sequence_number && !premature_flush {
                return Err(LsdbError::Stale {
                    key,
                    stored: stored_header.sequence_number,
                    received,
                });
            }
            if lsa.header().age >= MAX_AGE {
                UpsertOutcome::Flushed
            } else {
                UpsertOutcome::Replaced
            }
        }
        None if lsa.header().age >= MAX_AGE => return Ok(UpsertOutcome::Ignored),
        None => UpsertOutcome::Inserted,
    };

    if outcome == UpsertOutcome::Flushed {
        map.remove(&map_key);
    } else {
        map.insert(map_key, lsa);
    }
    Ok(outcome)
}

/// Ages every LSA of a map, evicting those reaching MaxAge.
fn age_map<K: Ord + Clone, L: LinkStateAdvertisement>(
    map: &mut BTreeMap<K, L>,
    elapsed: u16,
    area: Option<AreaId>,
    self_id: RouterId,
    refresh_at: u16,
    report: &mut AgingReport,
) -> bool {
    let mut evicted = false;
    map.retain(|_, lsa| {
        let header = lsa.header_mut();
        header.age = header.age.saturating_add(elapsed).min(MAX_AGE);
        if header.age >= MAX_AGE {
            report.evicted.push(AgedLsa::new(area, header));
            evicted = true;
            return false;
        }
        if header.advertising_router == self_id && header.age >= refresh_at {
            report.refresh_due.push(AgedLsa::new(area, header));
        }
        true
    });
    evicted
}

/// One LSA touched by aging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgedLsa {
    /// `None` for AS-scoped LSAs.
    pub area: Option<AreaId>,
    pub ls_type: LsaType,
    pub key: LsaKey,
}

impl AgedLsa {
    fn new(area: Option<AreaId>, header: &LsaHeader) -> Self {
        Self {
            area,
            ls_type: header.ls_type,
            key: header.key(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgingReport {
    pub evicted: Vec<AgedLsa>,
    /// Self-originated LSAs old enough to be re-originated.
    pub refresh_due: Vec<AgedLsa>,
}

/// The link-state database of one area.
#[derive(Debug, Clone)]
pub struct AreaLsdb {
    pub area: AreaId,
    router_lsas: BTreeMap<LsaKey, RouterLsa>,
    network_lsas: BTreeMap<Ipv4Addr, NetworkLsa>,
    summary_lsas: BTreeMap<LsaKey, SummaryLsa>,
    graph_dirty: bool,
    routes_dirty: bool,
}

impl AreaLsdb {
    pub fn new(area: AreaId) -> Self {
        Self {
            area,
            router_lsas: BTreeMap::new(),
            network_lsas: BTreeMap::new(),
            summary_lsas: BTreeMap::new(),
            graph_dirty: true,
            routes_dirty: true,
        }
    }

    pub fn router_lsas(&self) -> impl Iterator<Item = &RouterLsa> {
        self.router_lsas.values()
    }

    pub fn network_lsas(&self) -> impl Iterator<Item = &NetworkLsa> {
        self.network_lsas.values()
    }

    pub fn summary_lsas(&self) -> impl Iterator<Item = &SummaryLsa> {
        self.summary_lsas.values()
    }

    pub fn find_router_lsa(&self, key: &LsaKey) -> Option<&RouterLsa> {
        self.router_lsas.get(key)
    }

    /// The Router-LSA originated by `router`, whose link-state id is its router id.
    pub fn router_lsa_of(&self, router: RouterId) -> Option<&RouterLsa> {
        self.router_lsas.get(&LsaKey::new(router.addr(), router))
    }

    pub fn find_network_lsa(&self, link_state_id: Ipv4Addr) -> Option<&NetworkLsa> {
        self.network_lsas.get(&link_state_id)
    }

    pub fn find_summary_lsa(&self, key: &LsaKey) -> Option<&SummaryLsa> {
        self.summary_lsas.get(key)
    }

    pub fn is_graph_dirty(&self) -> bool {
        self.graph_dirty
    }

    pub fn is_routes_dirty(&self) -> bool {
        self.routes_dirty || self.graph_dirty
    }

    pub fn len(&self) -> usize {
        self.router_lsas.len() + self.network_lsas.len() + self.summary_lsas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn headers(&self) -> impl Iterator<Item = (&LsaHeader, Vec<u8>)> {
        self.router_lsas
            .values()
            .map(|lsa| (&lsa.header, lsa.encode()))
            .chain(self.network_lsas.values().map(|lsa| (&lsa.header, lsa.encode())))
            .chain(self.summary_lsas.values().map(|lsa| (&lsa.header, lsa.encode())))
    }
}

/// Entry of a database dump.
#[derive(Debug, Clone, Serialize)]
pub struct LsaDumpEntry {
    pub area: Option<AreaId>,
    pub header: LsaHeader,
    pub lsa_hex: String,
}

/// Per-area entry counts, as returned by queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LsdbSummary {
    pub areas: BTreeMap<AreaId, AreaLsdbCounts>,
    pub external_lsas: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AreaLsdbCounts {
    pub router_lsas: usize,
    pub network_lsas: usize,
    pub summary_lsas: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LsdbStats {
    pub accepted: u64,
    pub stale: u64,
    pub inconsistent: u64,
    pub malformed: u64,
    pub evicted: u64,
}

/// All areas' databases plus the AS-wide external LSAs.
#[derive(Debug, Clone)]
pub struct Lsdb {
    areas: BTreeMap<AreaId, AreaLsdb>,
    external_lsas: BTreeMap<LsaKey, AsExternalLsa>,
    ext_lsdb_limit: i32,
    stats: LsdbStats,
}

impl Default for Lsdb {
    fn default() -> Self {
        Self::new(-1)
    }
}

impl Lsdb {
    /// `ext_lsdb_limit` of -1 means unlimited.
    pub fn new(ext_lsdb_limit: i32) -> Self {
        Self {
            areas: BTreeMap::new(),
            external_lsas: BTreeMap::new(),
            ext_lsdb_limit,
            stats: LsdbStats::default(),
        }
    }

    pub fn set_ext_lsdb_limit(&mut self, limit: i32) {
        self.ext_lsdb_limit = limit;
    }

    pub fn stats(&self) -> LsdbStats {
        self.stats
    }

    /// Creates an empty database for `area`. An existing one is left untouched.
    pub fn init_ls_database(&mut self, area: AreaId) {
        self.areas.entry(area).or_insert_with(|| {
            debug!(area = %area, "link-state database initialized");
            AreaLsdb::new(area)
        });
    }

    /// Drops every area and every external LSA.
    pub fn stop_ls_database(&mut self) {
        debug!(areas = self.areas.len(), externals = self.external_lsas.len(), "link-state database stopped");
        self.areas.clear();
        self.external_lsas.clear();
    }

    pub fn area(&self, area: AreaId) -> Option<&AreaLsdb> {
        self.areas.get(&area)
    }

    pub fn areas(&self) -> impl Iterator<Item = &AreaLsdb> {
        self.areas.values()
    }

    pub fn area_ids(&self) -> Vec<AreaId> {
        self.areas.keys().copied().collect()
    }

    fn area_mut(&mut self, area: AreaId) -> Result<&mut AreaLsdb, LsdbError> {
        self.areas.get_mut(&area).ok_or(LsdbError::UnknownArea(area))
    }

    fn record(&mut self, result: Result<UpsertOutcome, LsdbError>) -> Result<UpsertOutcome, LsdbError> {
        match &result {
            Ok(outcome) if outcome.changed() => self.stats.accepted += 1,
            Ok(_) => {}
            Err(LsdbError::Stale { .. }) => self.stats.stale += 1,
            Err(LsdbError::Inconsistent { .. }) => self.stats.inconsistent += 1,
            Err(LsdbError::Malformed { .. }) => self.stats.malformed += 1,
            Err(_) => {}
        }
        result
    }

    pub fn upsert_router_lsa(&mut self, area: AreaId, lsa: RouterLsa) -> Result<UpsertOutcome, LsdbError> {
        let entry = self.area_mut(area)?;
        let result = upsert_into(&mut entry.router_lsas, lsa.key(), lsa, Some(area));
        if matches!(&result, Ok(outcome) if outcome.changed()) {
            entry.graph_dirty = true;
        }
        self.record(result)
    }

    pub fn upsert_network_lsa(&mut self, area: AreaId, lsa: NetworkLsa) -> Result<UpsertOutcome, LsdbError> {
        let entry = self.area_mut(area)?;
        let result = upsert_into(&mut entry.network_lsas, lsa.header.link_state_id, lsa, Some(area));
        if matches!(&result, Ok(outcome) if outcome.changed()) {
            entry.graph_dirty = true;
        }
        self.record(result)
    }

    pub fn upsert_summary_lsa(&mut self, area: AreaId, lsa: SummaryLsa) -> Result<UpsertOutcome, LsdbError> {
        let entry = self.area_mut(area)?;
        let result = upsert_into(&mut entry.summary_lsas, lsa.key(), lsa, Some(area));
        if matches!(&result, Ok(outcome) if outcome.changed()) {
            entry.routes_dirty = true;
        }
        self.record(result)
    }

    /// External LSAs are flooded AS-wide, so an accepted one dirties every area's routes.
    pub fn upsert_as_external_lsa(&mut self, lsa: AsExternalLsa) -> Result<UpsertOutcome, LsdbError> {
        let key = lsa.key();
        if self.ext_lsdb_limit >= 0
            && !self.external_lsas.contains_key(&key)
            && self.external_lsas.len() >= self.ext_lsdb_limit as usize
        {
            warn!(lsa = %key, limit = self.ext_lsdb_limit, "AS-external LSDB overflow");
            return Err(LsdbError::ExternalOverflow(self.ext_lsdb_limit));
        }
        let result = upsert_into(&mut self.external_lsas, key, lsa, None);
        if matches!(&result, Ok(outcome) if outcome.changed()) {
            for entry in self.areas.values_mut() {
                entry.routes_dirty = true;
            }
        }
        self.record(result)
    }

    pub fn find_router_lsa(&self, area: AreaId, key: &LsaKey) -> Option<&RouterLsa> {
        self.areas.get(&area)?.find_router_lsa(key)
    }

    pub fn find_network_lsa(&self, area: AreaId, link_state_id: Ipv4Addr) -> Option<&NetworkLsa> {
        self.areas.get(&area)?.find_network_lsa(link_state_id)
    }

    pub fn find_summary_lsa(&self, area: AreaId, key: &LsaKey) -> Option<&SummaryLsa> {
        self.areas.get(&area)?.find_summary_lsa(key)
    }

    pub fn external_lsas(&self) -> impl Iterator<Item = &AsExternalLsa> {
        self.external_lsas.values()
    }

    pub fn external_count(&self) -> usize {
        self.external_lsas.len()
    }

    pub fn external_checksum_sum(&self) -> u32 {
        self.external_lsas
            .values()
            .map(|lsa| lsa.header.checksum as u32)
            .fold(0u32, u32::wrapping_add)
    }

    /// Flags a checksum mismatch between two copies of the same LSA instance.
    /// Returns `true` when they agree. Nothing is repaired here.
    pub fn check_consistency(&mut self, area: AreaId, key: &LsaKey, old_checksum: u16, new_checksum: u16) -> bool {
        let ok = checksums_consistent(Some(area), key, old_checksum, new_checksum);
        if !ok {
            self.stats.inconsistent += 1;
        }
        ok
    }

    /// Areas whose graph must be rebuilt before the next SPF run.
    pub fn graph_dirty_areas(&self) -> Vec<AreaId> {
        self.areas.values().filter(|a| a.graph_dirty).map(|a| a.area).collect()
    }

    pub fn routes_dirty(&self) -> bool {
        self.areas.values().any(AreaLsdb::is_routes_dirty)
    }

    pub fn clear_dirty(&mut self, area: AreaId) {
        if let Some(entry) = self.areas.get_mut(&area) {
            entry.graph_dirty = false;
            entry.routes_dirty = false;
        }
    }

    /// The area's graph was patched in place; only its routes are stale now.
    pub fn mark_graph_synced(&mut self, area: AreaId) {
        if let Some(entry) = self.areas.get_mut(&area) {
            entry.graph_dirty = false;
            entry.routes_dirty = true;
        }
    }

    pub fn clear_all_dirty(&mut self) {
        for entry in self.areas.values_mut() {
            entry.graph_dirty = false;
            entry.routes_dirty = false;
        }
    }

    /// Adds `elapsed` seconds to every LSA age. Entries reaching MaxAge are
    /// evicted and their area marked dirty. Self-originated entries at least
    /// `refresh_at` seconds old are reported for re-origination.
    pub fn age_by(&mut self, elapsed: u16, self_id: RouterId, refresh_at: u16) -> AgingReport {
        let mut report = AgingReport::default();
        for entry in self.areas.values_mut() {
            let area = Some(entry.area);
            let routers = age_map(&mut entry.router_lsas, elapsed, area, self_id, refresh_at, &mut report);
            let networks = age_map(&mut entry.network_lsas, elapsed, area, self_id, refresh_at, &mut report);
            let summaries = age_map(&mut entry.summary_lsas, elapsed, area, self_id, refresh_at, &mut report);
            if routers || networks {
                entry.graph_dirty = true;
            }
            if summaries {
                entry.routes_dirty = true;
            }
        }
        if age_map(&mut self.external_lsas, elapsed, None, self_id, refresh_at, &mut report) {
            for entry in self.areas.values_mut() {
                entry.routes_dirty = true;
            }
        }
        self.stats.evicted += report.evicted.len() as u64;
        report
    }

    /// Every header of `area` with its hex-encoded canonical encoding.
    pub fn dump_lsdb(&self, area: AreaId) -> Result<Vec<LsaDumpEntry>, LsdbError> {
        let entry = self.areas.get(&area).ok_or(LsdbError::UnknownArea(area))?;
        Ok(entry
            .headers()
            .map(|(header, bytes)| LsaDumpEntry {
                area: Some(area),
                header: header.clone(),
                lsa_hex: hex::encode(bytes),
            })
            .collect())
    }

    /// Every AS-external header with its hex-encoded canonical encoding.
    pub fn dump_external_lsdb(&self) -> Vec<LsaDumpEntry> {
        self.external_lsas
            .values()
            .map(|lsa| LsaDumpEntry {
                area: None,
                header: lsa.header.clone(),
                lsa_hex: hex::encode(lsa.encode()),
            })
            .collect()
    }

    pub fn summary(&self) -> LsdbSummary {
        LsdbSummary {
            areas: self
                .areas
                .iter()
                .map(|(id, entry)| {
                    (
                        *id,
                        AreaLsdbCounts {
                            router_lsas: entry.router_lsas.len(),
                            network_lsas: entry.network_lsas.len(),
                            summary_lsas: entry.summary_lsas.len(),
                        },
                    )
                })
                .collect(),
            external_lsas: self.external_lsas.len(),
        }
    }
}
