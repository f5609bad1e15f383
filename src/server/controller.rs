/*!
The control loop state.

`Controller` exclusively owns the LSDB, the area graphs, the SPF trees, the
global routing table and the global configuration. Workers never touch them:
they post `ControlEvent`s, which the control loop feeds to
`Controller::handle_event` one at a time.

Admin transitions follow a fixed order. Running interfaces are stopped first,
then the protocol workers and the LSDB; the new global config is applied; if
the instance is enabled the workers and the LSDB are started again before the
interfaces that were administratively enabled are brought back up.
*/

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use ipnetwork::Ipv4Network;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::{AdminState, AreaConf, ConfigError, DaemonConfig, GlobalConf, GlobalState, IntfConf, Timers},
    network::{
        lsa::{LS_REFRESH_TIME, Lsa, LsaType, MAX_AGE, MAX_SEQUENCE_NUMBER, RouterLsaFlags},
        network_graph::{AreaGraph, GraphError},
        packet::{InboundPacket, LsUpdate, OspfPacket},
        router::{AreaId, IntfKey, RouterId},
    },
    server::{
        events::{ControlEvent, NeighborChange, NeighborConfUpdate, NeighborState, Query, Session},
        interface::{self, InterfaceWorker},
        neighbor,
        origination::{
            Adjacency, build_network_lsa, build_router_lsa, flushed, same_network_body, same_router_body,
        },
        shutdown::ShutdownToken,
        spf_scheduler,
    },
    topology::{
        forwarding::{ForwardingPlane, apply_route_diff},
        routing_table::{GlobalRoutingTbl, RouteInputs, consolidate_routing_tbl, diff_routing_tbl, install_routing_tbl},
        source::{ALL_SPF_ROUTERS, PacketIoProvider},
        spf::{SpfTree, execute_dijkstra},
        store::{AreaLsdb, Lsdb, LsdbError, UpsertOutcome},
    },
};

/// Runtime parameters of the control loop and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub timers: Timers,
    pub channel_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&DaemonConfig::default())
    }
}

impl From<&DaemonConfig> for ControllerSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            timers: config.timers.clone(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// Workers that run while the instance is enabled.
struct ProtocolWorkers {
    neighbor_fsm: ShutdownToken,
    neighbor_conf: ShutdownToken,
    packet_rx: ShutdownToken,
    spf_scheduler: ShutdownToken,
    neighbor_conf_tx: mpsc::Sender<NeighborConfUpdate>,
    inbound_tx: mpsc::Sender<InboundPacket>,
    spf_trigger: mpsc::Sender<()>,
}

impl ProtocolWorkers {
    fn start(
        router_id: RouterId,
        session: Session,
        settings: &ControllerSettings,
        events: mpsc::Sender<ControlEvent>,
    ) -> Self {
        let capacity = settings.channel_capacity;
        let (neighbor_tx, neighbor_rx) = mpsc::channel(capacity);
        let (neighbor_conf_tx, neighbor_conf_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (spf_trigger, spf_trigger_rx) = mpsc::channel(1);

        let mut neighbor_fsm = ShutdownToken::new("neighbor-fsm");
        let stop = neighbor_fsm.subscribe();
        neighbor_fsm.add_task(tokio::spawn(neighbor::run_neighbor_fsm(
            router_id,
            session,
            neighbor_rx,
            events.clone(),
            stop,
        )));

        let mut neighbor_conf = ShutdownToken::new("neighbor-conf");
        let stop = neighbor_conf.subscribe();
        neighbor_conf.add_task(tokio::spawn(neighbor::run_neighbor_conf(
            neighbor_conf_rx,
            neighbor_tx.clone(),
            stop,
        )));

        let mut packet_rx = ShutdownToken::new("packet-rx");
        let stop = packet_rx.subscribe();
        packet_rx.add_task(tokio::spawn(interface::run_packet_rx(
            router_id,
            session,
            inbound_rx,
            neighbor_tx,
            events.clone(),
            stop,
        )));

        let mut spf_scheduler = ShutdownToken::new("spf-scheduler");
        let stop = spf_scheduler.subscribe();
        spf_scheduler.add_task(tokio::spawn(spf_scheduler::run_spf_scheduler(
            settings.timers.spf_delay,
            settings.timers.spf_hold,
            session,
            spf_trigger_rx,
            events,
            stop,
        )));

        Self {
            neighbor_fsm,
            neighbor_conf,
            packet_rx,
            spf_scheduler,
            neighbor_conf_tx,
            inbound_tx,
            spf_trigger,
        }
    }

    fn notify_neighbor_conf(&self, update: NeighborConfUpdate) {
        if let Err(e) = self.neighbor_conf_tx.try_send(update) {
            warn!(error = %e, "neighbor conf update dropped");
        }
    }

    /// A full trigger queue means a run is already pending.
    fn trigger_spf(&self) {
        let _ = self.spf_trigger.try_send(());
    }

    /// Signals every worker, then waits for all of them.
    async fn stop(mut self) {
        for token in [&self.neighbor_fsm, &self.neighbor_conf, &self.packet_rx, &self.spf_scheduler] {
            token.signal_stop();
        }
        for token in [
            &mut self.neighbor_fsm,
            &mut self.neighbor_conf,
            &mut self.packet_rx,
            &mut self.spf_scheduler,
        ] {
            token.join_all().await;
        }
    }
}

pub struct Controller {
    settings: ControllerSettings,
    global: GlobalState,
    areas: BTreeMap<AreaId, AreaConf>,
    interfaces: BTreeMap<IntfKey, IntfConf>,
    lsdb: Lsdb,
    graphs: BTreeMap<AreaId, AreaGraph>,
    spf_trees: BTreeMap<AreaId, SpfTree>,
    routing_table: GlobalRoutingTbl,
    /// Routes the forwarding plane has accepted.
    forwarded: GlobalRoutingTbl,
    adjacencies: BTreeMap<(IntfKey, RouterId), Adjacency>,
    workers: Option<ProtocolWorkers>,
    /// Session of the most recently started workers.
    session: Session,
    running: BTreeMap<IntfKey, InterfaceWorker>,
    /// Elapsed time not yet applied to LSA ages.
    pending_age: Duration,
    events: mpsc::Sender<ControlEvent>,
    forwarder: Arc<dyn ForwardingPlane>,
    packet_io: Arc<dyn PacketIoProvider>,
}

impl Controller {
    /// `events` is the control loop's own queue; workers get clones of it.
    pub fn new(
        settings: ControllerSettings,
        forwarder: Arc<dyn ForwardingPlane>,
        packet_io: Arc<dyn PacketIoProvider>,
        events: mpsc::Sender<ControlEvent>,
    ) -> Self {
        let global = GlobalState::default();
        Self {
            lsdb: Lsdb::new(global.conf.ext_lsdb_limit),
            settings,
            global,
            areas: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            graphs: BTreeMap::new(),
            spf_trees: BTreeMap::new(),
            routing_table: GlobalRoutingTbl::default(),
            forwarded: GlobalRoutingTbl::default(),
            adjacencies: BTreeMap::new(),
            workers: None,
            session: Session::default(),
            running: BTreeMap::new(),
            pending_age: Duration::ZERO,
            events,
            forwarder,
            packet_io,
        }
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    pub fn lsdb(&self) -> &Lsdb {
        &self.lsdb
    }

    pub fn graph(&self, area: AreaId) -> Option<&AreaGraph> {
        self.graphs.get(&area)
    }

    pub fn spf_tree(&self, area: AreaId) -> Option<&SpfTree> {
        self.spf_trees.get(&area)
    }

    pub fn routing_table(&self) -> &GlobalRoutingTbl {
        &self.routing_table
    }

    pub fn adjacencies(&self) -> impl Iterator<Item = &Adjacency> {
        self.adjacencies.values()
    }

    /// Whether the protocol workers are running.
    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    pub fn session(&self) -> Session {
        self.session
    }

    /// Whether an event posted in `session` came from workers that have
    /// since been stopped.
    fn is_stale(&self, session: Session, event: &'static str) -> bool {
        let stale = self.workers.is_none() || session != self.session;
        if stale {
            debug!(event, session = session.0, current = self.session.0, "event from stopped workers dropped");
        }
        stale
    }

    pub fn running_interfaces(&self) -> Vec<IntfKey> {
        self.running.keys().copied().collect()
    }

    /// Processes one event. `Break` once the control loop should exit.
    pub async fn handle_event(&mut self, event: ControlEvent) -> ControlFlow<()> {
        match event {
            ControlEvent::ApplyGlobal { conf, reply } => {
                let result = self.process_global_config(conf).await;
                let _ = reply.send(result);
            }
            ControlEvent::ApplyArea { conf, reply } => {
                let result = self.apply_area_config(conf);
                let _ = reply.send(result);
            }
            ControlEvent::ApplyIntf { conf, reply } => {
                let result = self.apply_intf_config(conf).await;
                let _ = reply.send(result);
            }
            ControlEvent::LsUpdate {
                session,
                intf,
                source,
                update,
            } => {
                if !session.is_some_and(|session| self.is_stale(session, "ls-update")) {
                    self.handle_ls_update(intf, source, update);
                }
            }
            ControlEvent::Neighbor { session, change } => {
                if !self.is_stale(session, "neighbor") {
                    self.handle_neighbor_change(change);
                }
            }
            ControlEvent::RunSpf(session) => {
                if !self.is_stale(session, "run-spf") {
                    self.run_spf().await;
                }
            }
            ControlEvent::Query(query) => self.answer(query),
            ControlEvent::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Applies a new global config. Nothing changes if it fails validation.
    pub async fn process_global_config(&mut self, conf: GlobalConf) -> Result<(), ConfigError> {
        conf.validate()?;

        let snapshot: Vec<IntfKey> = self
            .interfaces
            .values()
            .filter(|intf| intf.admin_state.is_enabled())
            .map(|intf| intf.key)
            .collect();
        let was_enabled = self.global.is_enabled();
        let now_enabled = conf.admin_state.is_enabled();

        if was_enabled {
            let keys: Vec<IntfKey> = self.running.keys().copied().collect();
            for key in keys {
                self.stop_interface(key).await;
            }
            self.stop_protocol().await;
        }

        info!(
            router_id = %conf.router_id,
            admin_state = ?conf.admin_state,
            asbr = conf.as_border_router,
            "global config applied"
        );
        self.lsdb.set_ext_lsdb_limit(conf.ext_lsdb_limit);
        self.global.conf = conf;

        if now_enabled {
            self.start_protocol();
            for key in snapshot {
                self.start_interface(key).await;
            }
            self.refresh_border_status();
            for area in self.lsdb.area_ids() {
                self.originate_area(area, false);
            }
            self.trigger_spf();
        }
        Ok(())
    }

    pub fn apply_area_config(&mut self, conf: AreaConf) -> Result<(), ConfigError> {
        let area = conf.area_id;
        info!(area = %area, import_as_extern = conf.import_as_extern, "area config applied");
        self.areas.insert(area, conf);
        if self.global.is_enabled() {
            self.lsdb.init_ls_database(area);
            self.originate_area(area, false);
            self.trigger_spf();
        }
        Ok(())
    }

    pub async fn apply_intf_config(&mut self, conf: IntfConf) -> Result<(), ConfigError> {
        conf.validate()?;
        if !self.areas.contains_key(&conf.area_id) {
            return Err(ConfigError::UnknownArea(conf.area_id));
        }

        let key = conf.key;
        let area = conf.area_id;
        let enabled = conf.admin_state.is_enabled();
        let previous = self.interfaces.insert(key, conf);
        let changed = previous.as_ref() != self.interfaces.get(&key);
        info!(intf = %key, area = %area, enabled, "interface config applied");

        let should_run = self.global.is_enabled() && enabled;
        if self.running.contains_key(&key) && (!should_run || changed) {
            self.stop_interface(key).await;
        }
        if should_run {
            self.start_interface(key).await;
        }

        if self.global.is_enabled() {
            let mut affected: BTreeSet<AreaId> = previous.map(|old| old.area_id).into_iter().collect();
            affected.insert(area);
            if self.refresh_border_status() {
                affected.extend(self.lsdb.area_ids());
            }
            for area in affected {
                self.originate_area(area, false);
            }
            self.trigger_spf();
        }
        Ok(())
    }

    fn start_protocol(&mut self) {
        self.adjacencies.clear();
        self.session = self.session.next();
        self.workers = Some(ProtocolWorkers::start(
            self.global.router_id(),
            self.session,
            &self.settings,
            self.events.clone(),
        ));
        for area in self.areas.keys() {
            self.lsdb.init_ls_database(*area);
        }
        info!(
            router_id = %self.global.router_id(),
            areas = self.areas.len(),
            session = self.session.0,
            "protocol started"
        );
    }

    /// Stops the workers, clears all learned state and withdraws every route.
    async fn stop_protocol(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.stop().await;
        }
        self.lsdb.stop_ls_database();
        self.graphs.clear();
        self.spf_trees.clear();
        self.adjacencies.clear();
        self.global.area_border_router = false;
        self.refresh_external_counters();

        self.routing_table = GlobalRoutingTbl::default();
        self.sync_forwarding().await;
        info!("protocol stopped");
    }

    async fn start_interface(&mut self, key: IntfKey) {
        if self.running.contains_key(&key) {
            return;
        }
        let Some(conf) = self.interfaces.get(&key).cloned() else {
            return;
        };
        if !conf.admin_state.is_enabled() {
            return;
        }
        let Some(workers) = &self.workers else {
            return;
        };
        let io = match self.packet_io.open(key).await {
            Ok(io) => io,
            Err(e) => {
                warn!(intf = %key, error = %e, "interface not started");
                return;
            }
        };
        workers.notify_neighbor_conf(NeighborConfUpdate::IntfUp((&conf).into()));
        let worker = interface::spawn_interface(
            conf,
            self.global.router_id(),
            io,
            workers.inbound_tx.clone(),
            self.settings.channel_capacity,
        );
        self.running.insert(key, worker);
    }

    async fn stop_interface(&mut self, key: IntfKey) -> bool {
        let Some(worker) = self.running.remove(&key) else {
            return false;
        };
        worker.stop().await;
        if let Some(workers) = &self.workers {
            workers.notify_neighbor_conf(NeighborConfUpdate::IntfDown(key));
        }
        self.adjacencies.retain(|(intf, _), _| *intf != key);
        true
    }

    /// Recomputes the ABR flag; true if it changed.
    fn refresh_border_status(&mut self) -> bool {
        let attached: BTreeSet<AreaId> = self.running.values().map(|worker| worker.area).collect();
        let border = attached.len() > 1;
        let changed = border != self.global.area_border_router;
        if changed {
            info!(area_border_router = border, "border router status changed");
        }
        self.global.area_border_router = border;
        changed
    }

    fn refresh_external_counters(&mut self) {
        self.global.counters.extern_lsa_count = self.lsdb.external_count() as u32;
        self.global.counters.extern_lsa_checksum = self.lsdb.external_checksum_sum();
    }

    fn trigger_spf(&self) {
        if let Some(workers) = &self.workers {
            workers.trigger_spf();
        }
    }

    fn is_stub_area(&self, area: AreaId) -> bool {
        self.areas.get(&area).is_some_and(|conf| !conf.import_as_extern)
    }

    /// Installs one LSA into the LSDB and keeps the area graph in step with it.
    pub fn install_lsa(&mut self, area: AreaId, lsa: Lsa) -> Result<UpsertOutcome, LsdbError> {
        // An in-place patch is only valid on a graph that reflects the LSDB.
        let graph_current = self.graphs.contains_key(&area)
            && self.lsdb.area(area).is_some_and(|entry| !entry.is_graph_dirty());

        let outcome = match lsa {
            Lsa::Router(lsa) => {
                let router = lsa.header.advertising_router;
                let outcome = self.lsdb.upsert_router_lsa(area, lsa)?;
                if outcome.changed() && graph_current {
                    self.patch_graph(area, |graph, entry| graph.update_router_lsa(entry, router));
                }
                outcome
            }
            Lsa::Network(lsa) => {
                let designated_router = lsa.header.link_state_id;
                let outcome = self.lsdb.upsert_network_lsa(area, lsa)?;
                if outcome.changed() && graph_current {
                    self.patch_graph(area, |graph, entry| graph.update_network_lsa(entry, designated_router));
                }
                outcome
            }
            Lsa::Summary(lsa) => self.lsdb.upsert_summary_lsa(area, lsa)?,
            Lsa::AsExternal(lsa) => {
                let outcome = self.lsdb.upsert_as_external_lsa(lsa)?;
                self.refresh_external_counters();
                outcome
            }
        };
        if outcome.changed() {
            self.trigger_spf();
        }
        Ok(outcome)
    }

    fn patch_graph(
        &mut self,
        area: AreaId,
        patch: impl FnOnce(&mut AreaGraph, &AreaLsdb) -> Vec<GraphError>,
    ) {
        let (Some(graph), Some(entry)) = (self.graphs.get_mut(&area), self.lsdb.area(area)) else {
            return;
        };
        for error in patch(graph, entry) {
            debug!(area = %area, error = %error, "dangling reference dropped");
        }
        self.lsdb.mark_graph_synced(area);
    }

    /// Sends `lsa` out of every interface with an adjacency in its flooding
    /// scope, except `except`.
    fn flood(&self, area: AreaId, except: Option<IntfKey>, lsa: &Lsa) {
        let as_scoped = matches!(lsa, Lsa::AsExternal(_));
        let router_id = self.global.router_id();
        for worker in self.running.values() {
            if Some(worker.key) == except {
                continue;
            }
            let in_scope = if as_scoped {
                !self.is_stub_area(worker.area)
            } else {
                worker.area == area
            };
            if !in_scope || !self.adjacencies.keys().any(|(intf, _)| *intf == worker.key) {
                continue;
            }
            let packet = OspfPacket::LsUpdate(LsUpdate {
                router_id,
                area: worker.area,
                lsas: vec![lsa.clone()],
            });
            worker.try_send(ALL_SPF_ROUTERS, packet);
        }
    }

    fn originate(&mut self, area: AreaId, lsa: Lsa) {
        let key = lsa.header().key();
        let ls_type = lsa.header().ls_type;
        match self.install_lsa(area, lsa.clone()) {
            Ok(outcome) if outcome.changed() => {
                self.global.counters.originate_new_lsas += 1;
                debug!(area = %area, lsa = %key, ls_type = ?ls_type, ?outcome, "LSA originated");
                self.flood(area, None, &lsa);
            }
            Ok(_) => {}
            Err(e) => warn!(area = %area, lsa = %key, error = %e, "self-originated LSA rejected"),
        }
    }

    /// Re-originates this router's LSAs for `area` when their contents
    /// changed, or unconditionally with `force`. Network-LSAs of segments we
    /// are no longer DR for are flushed.
    fn originate_area(&mut self, area: AreaId, force: bool) {
        if !self.global.is_enabled() {
            return;
        }
        let Some(area_lsdb) = self.lsdb.area(area) else {
            return;
        };
        let self_id = self.global.router_id();
        let flags = RouterLsaFlags {
            border: self.global.area_border_router,
            external: self.global.conf.as_border_router,
            virtual_endpoint: false,
        };

        let interfaces: Vec<(&IntfConf, Vec<&Adjacency>)> = self
            .running
            .values()
            .filter(|worker| worker.area == area)
            .filter_map(|worker| self.interfaces.get(&worker.key))
            .map(|conf| {
                let adjacencies = self.adjacencies.values().filter(|adj| adj.intf == conf.key).collect();
                (conf, adjacencies)
            })
            .collect();

        let mut originated = Vec::new();
        let stored = area_lsdb.router_lsa_of(self_id);
        if interfaces.is_empty() {
            if let Some(stored) = stored {
                originated.push(flushed(&Lsa::Router(stored.clone())));
            }
        } else {
            let lsa = build_router_lsa(self_id, flags, &interfaces, stored.map(|s| s.header.sequence_number));
            if force || !stored.is_some_and(|s| same_router_body(s, &lsa)) {
                // The wrapped sequence number is only accepted once the old instance is gone.
                if let Some(stored) = stored.filter(|s| s.header.sequence_number == MAX_SEQUENCE_NUMBER) {
                    originated.push(flushed(&Lsa::Router(stored.clone())));
                }
                originated.push(Lsa::Router(lsa));
            }
        }

        for (conf, adjacencies) in &interfaces {
            let stored = area_lsdb
                .find_network_lsa(conf.key.ip_address)
                .filter(|lsa| lsa.header.advertising_router == self_id);
            match build_network_lsa(self_id, conf, adjacencies, stored.map(|s| s.header.sequence_number)) {
                Some(lsa) => {
                    if force || !stored.is_some_and(|s| same_network_body(s, &lsa)) {
                        if let Some(stored) = stored.filter(|s| s.header.sequence_number == MAX_SEQUENCE_NUMBER) {
                            originated.push(flushed(&Lsa::Network(stored.clone())));
                        }
                        originated.push(Lsa::Network(lsa));
                    }
                }
                None => {
                    if let Some(stored) = stored {
                        originated.push(flushed(&Lsa::Network(stored.clone())));
                    }
                }
            }
        }

        // Our Network-LSAs for segments we no longer run.
        let local: BTreeSet<Ipv4Addr> = interfaces.iter().map(|(conf, _)| conf.key.ip_address).collect();
        for lsa in area_lsdb.network_lsas() {
            if lsa.header.advertising_router == self_id && !local.contains(&lsa.header.link_state_id) {
                originated.push(flushed(&Lsa::Network(lsa.clone())));
            }
        }

        for lsa in originated {
            self.originate(area, lsa);
        }
    }

    /// Another router flooded a newer instance of one of our LSAs.
    fn supersede_self_lsa(&mut self, area: AreaId, lsa: &Lsa) {
        match lsa {
            Lsa::Router(_) => self.originate_area(area, false),
            Lsa::Network(network)
                if self
                    .running
                    .values()
                    .any(|worker| worker.area == area && worker.key.ip_address == network.header.link_state_id) =>
            {
                self.originate_area(area, false)
            }
            other => self.originate(area, flushed(other)),
        }
    }

    /// Handles an LS Update received on `intf`.
    pub fn handle_ls_update(&mut self, intf: IntfKey, source: Ipv4Addr, update: LsUpdate) {
        if !self.global.is_enabled() {
            return;
        }
        let Some(area) = self.running.get(&intf).map(|worker| worker.area) else {
            debug!(intf = %intf, "LS update on an interface that is not running, dropped");
            return;
        };
        if update.area != area {
            warn!(intf = %intf, area = %update.area, expected = %area, "LS update for a different area, dropped");
            return;
        }
        if !self.adjacencies.contains_key(&(intf, update.router_id)) {
            self.global.counters.rx_dropped_unknown_neighbor += 1;
            warn!(
                intf = %intf,
                neighbor = %update.router_id,
                source = %source,
                "LS update from a router without a full adjacency, dropped"
            );
            return;
        }

        let self_id = self.global.router_id();
        for lsa in update.lsas {
            if matches!(lsa, Lsa::AsExternal(_)) && self.is_stub_area(area) {
                debug!(intf = %intf, lsa = %lsa.header().key(), "AS-external LSA in a stub area, dropped");
                continue;
            }
            let key = lsa.header().key();
            match self.install_lsa(area, lsa.clone()) {
                Ok(outcome) if outcome.changed() => {
                    self.global.counters.rx_new_lsas += 1;
                    debug!(area = %area, lsa = %key, ?outcome, "LSA accepted");
                    self.flood(area, Some(intf), &lsa);
                    if lsa.header().advertising_router == self_id {
                        self.supersede_self_lsa(area, &lsa);
                    }
                }
                Ok(_) => {}
                Err(LsdbError::Stale { .. }) => debug!(area = %area, lsa = %key, "stale LSA ignored"),
                Err(e) => warn!(area = %area, lsa = %key, error = %e, "LSA rejected"),
            }
        }
    }

    /// Applies a Full/Down transition reported by the neighbor FSM.
    pub fn handle_neighbor_change(&mut self, change: NeighborChange) {
        if !self.global.is_enabled() {
            return;
        }
        let Some(area) = self.running.get(&change.intf).map(|worker| worker.area) else {
            debug!(intf = %change.intf, neighbor = %change.router_id, "neighbor change on a stopped interface");
            return;
        };
        let key = (change.intf, change.router_id);
        match change.state {
            NeighborState::Full => {
                let fresh = self.adjacencies.insert(key, Adjacency::from(&change)).is_none();
                self.originate_area(area, false);
                if fresh {
                    info!(intf = %change.intf, neighbor = %change.router_id, "adjacency established");
                    self.sync_database(change.intf, area, change.address);
                }
            }
            NeighborState::Down | NeighborState::Init => {
                if self.adjacencies.remove(&key).is_some() {
                    info!(intf = %change.intf, neighbor = %change.router_id, "adjacency lost");
                    self.originate_area(area, false);
                }
            }
        }
        self.trigger_spf();
    }

    /// Sends the whole database in flooding scope of `area` to a new neighbor.
    fn sync_database(&self, intf: IntfKey, area: AreaId, destination: Ipv4Addr) {
        let (Some(worker), Some(entry)) = (self.running.get(&intf), self.lsdb.area(area)) else {
            return;
        };
        let mut lsas: Vec<Lsa> = entry
            .router_lsas()
            .cloned()
            .map(Lsa::Router)
            .chain(entry.network_lsas().cloned().map(Lsa::Network))
            .chain(entry.summary_lsas().cloned().map(Lsa::Summary))
            .collect();
        if !self.is_stub_area(area) {
            lsas.extend(self.lsdb.external_lsas().cloned().map(Lsa::AsExternal));
        }
        if lsas.is_empty() {
            return;
        }
        debug!(intf = %intf, neighbor = %destination, lsas = lsas.len(), "database sent to new neighbor");
        worker.try_send(
            destination,
            OspfPacket::LsUpdate(LsUpdate {
                router_id: self.global.router_id(),
                area,
                lsas,
            }),
        );
    }

    /// Rebuilds dirty graphs, reruns Dijkstra for every area and pushes the
    /// resulting routing table changes to the forwarding plane.
    pub async fn run_spf(&mut self) {
        if !self.global.is_enabled() {
            return;
        }
        let root = self.global.router_id();
        let area_ids = self.lsdb.area_ids();
        self.graphs.retain(|area, _| area_ids.contains(area));
        self.spf_trees.retain(|area, _| area_ids.contains(area));

        for entry in self.lsdb.areas() {
            let area = entry.area;
            if entry.is_graph_dirty() || !self.graphs.contains_key(&area) {
                let (graph, errors) = AreaGraph::build(entry);
                for error in errors {
                    debug!(area = %area, error = %error, "dangling reference dropped");
                }
                self.graphs.insert(area, graph);
            }
            let tree = match self.graphs.get(&area).map(|graph| execute_dijkstra(graph, root)) {
                Some(Ok(tree)) => tree,
                Some(Err(e)) => {
                    debug!(area = %area, error = %e, "no shortest path tree");
                    SpfTree::default()
                }
                None => SpfTree::default(),
            };
            self.spf_trees.insert(area, tree);
        }
        self.lsdb.clear_all_dirty();
        self.global.counters.spf_runs += 1;
        debug!(areas = area_ids.len(), runs = self.global.counters.spf_runs, "spf run complete");

        self.install_routes().await;
    }

    async fn install_routes(&mut self) {
        let stub_areas: BTreeSet<AreaId> = self
            .areas
            .values()
            .filter(|conf| !conf.import_as_extern)
            .map(|conf| conf.area_id)
            .collect();
        let local_networks: Vec<Ipv4Network> = self
            .running
            .keys()
            .filter_map(|key| self.interfaces.get(key))
            .filter_map(|conf| conf.network().ok())
            .collect();
        let inputs = RouteInputs {
            router_id: self.global.router_id(),
            lsdb: &self.lsdb,
            trees: &self.spf_trees,
            stub_areas: &stub_areas,
            local_networks: &local_networks,
        };
        self.routing_table = consolidate_routing_tbl(install_routing_tbl(&inputs));
        self.sync_forwarding().await;
    }

    /// Pushes the difference between the routing table and what the
    /// forwarding plane holds. Rejected updates stay pending and are pushed
    /// again on the next call. Returns the number still pending.
    pub async fn sync_forwarding(&mut self) -> usize {
        let diff = diff_routing_tbl(&self.forwarded, &self.routing_table);
        if diff.is_empty() {
            return 0;
        }
        let applied = apply_route_diff(self.forwarder.as_ref(), &diff).await;
        self.forwarded.record(&applied);
        let pending = diff.len() - applied.len();
        info!(
            installed = applied.installs.len(),
            withdrawn = applied.withdrawals.len(),
            pending,
            routes = self.routing_table.len(),
            "forwarding plane updated"
        );
        pending
    }

    /// Adds `elapsed` to every LSA age, evicting MaxAge entries and
    /// re-originating our own LSAs once they are due for refresh.
    pub fn age_lsdb(&mut self, elapsed: Duration) {
        if !self.global.is_enabled() {
            return;
        }
        self.pending_age += elapsed;
        let seconds = self.pending_age.as_secs();
        if seconds == 0 {
            return;
        }
        self.pending_age -= Duration::from_secs(seconds);

        let jitter = self
            .settings
            .timers
            .refresh_jitter
            .as_secs()
            .min(u64::from(LS_REFRESH_TIME / 2)) as u16;
        let refresh_at = LS_REFRESH_TIME - rand::rng().random_range(0..=jitter);
        let elapsed = seconds.min(u64::from(MAX_AGE)) as u16;
        let report = self.lsdb.age_by(elapsed, self.global.router_id(), refresh_at);

        for aged in &report.evicted {
            debug!(area = ?aged.area.map(|a| a.to_string()), lsa = %aged.key, ls_type = ?aged.ls_type, "LSA reached MaxAge");
        }
        let refresh: BTreeSet<AreaId> = report
            .refresh_due
            .iter()
            .filter(|aged| matches!(aged.ls_type, LsaType::Router | LsaType::Network))
            .filter_map(|aged| aged.area)
            .collect();
        for area in refresh {
            debug!(area = %area, "refreshing self-originated LSAs");
            self.originate_area(area, true);
        }
        if !report.evicted.is_empty() {
            self.refresh_external_counters();
            self.trigger_spf();
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::RoutingTable(reply) => {
                let _ = reply.send(self.routing_table.clone());
            }
            Query::DumpRoutingTable(reply) => {
                let _ = reply.send(self.routing_table.dump_global_routing_tbl());
            }
            Query::LsdbSummary(reply) => {
                let _ = reply.send(self.lsdb.summary());
            }
            Query::DumpLsdb(area, reply) => {
                let _ = reply.send(self.lsdb.dump_lsdb(area));
            }
            Query::DumpExternalLsdb(reply) => {
                let _ = reply.send(self.lsdb.dump_external_lsdb());
            }
            Query::DumpGraph(area, reply) => {
                let _ = reply.send(self.graphs.get(&area).map(AreaGraph::dump_dot));
            }
            Query::DumpVertex(area, key, reply) => {
                let _ = reply.send(self.graphs.get(&area).and_then(|graph| graph.dump_vertex(&key)));
            }
            Query::SpfTree(area, reply) => {
                let _ = reply.send(self.spf_trees.get(&area).cloned());
            }
            Query::GlobalState(reply) => {
                let _ = reply.send(self.global.clone());
            }
        }
    }

    /// Disables the instance if it is enabled.
    pub async fn shutdown(&mut self) {
        if !self.global.is_enabled() {
            return;
        }
        let mut conf = self.global.conf.clone();
        conf.admin_state = AdminState::Disabled;
        if let Err(e) = self.process_global_config(conf).await {
            warn!(error = %e, "disable on shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        logging,
        network::{
            lsa::{INITIAL_SEQUENCE_NUMBER, NetworkLsa, RouterLink, RouterLinkType, RouterLsa},
            node::{NextHop, VertexKey},
        },
        topology::{
            forwarding::{ChannelForwarder, ForwardingError, RouteUpdate},
            routing_table::RouteEntry,
            source::{ChannelPacketIoProvider, WireEnd},
        },
    };

    const ME: RouterId = RouterId::new(1, 1, 1, 1);
    const NEIGHBOR: RouterId = RouterId::new(2, 2, 2, 2);
    const AREA: AreaId = AreaId::BACKBONE;
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const NEIGHBOR_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    struct Harness {
        controller: Controller,
        _events: mpsc::Receiver<ControlEvent>,
        routes: mpsc::Receiver<RouteUpdate>,
        provider: Arc<ChannelPacketIoProvider>,
    }

    fn harness() -> Harness {
        logging::init_for_tests();
        let (events_tx, events_rx) = mpsc::channel(64);
        let (forwarder, routes) = ChannelForwarder::new(64);
        let provider = Arc::new(ChannelPacketIoProvider::new(64));
        let controller = Controller::new(
            ControllerSettings::default(),
            Arc::new(forwarder),
            provider.clone(),
            events_tx,
        );
        Harness {
            controller,
            _events: events_rx,
            routes,
            provider,
        }
    }

    fn enabled() -> GlobalConf {
        GlobalConf {
            router_id: ME,
            admin_state: AdminState::Enabled,
            ..GlobalConf::default()
        }
    }

    fn disabled() -> GlobalConf {
        GlobalConf {
            admin_state: AdminState::Disabled,
            ..enabled()
        }
    }

    fn intf() -> IntfKey {
        IntfKey::new(LOCAL, 2)
    }

    fn full_neighbor() -> NeighborChange {
        NeighborChange {
            intf: intf(),
            area: AREA,
            router_id: NEIGHBOR,
            address: NEIGHBOR_ADDR,
            priority: 1,
            state: NeighborState::Full,
        }
    }

    /// Enabled instance with one running broadcast interface.
    async fn with_interface(h: &mut Harness) -> WireEnd {
        let wire = h.provider.attach(intf());
        h.controller.apply_area_config(AreaConf::new(AREA)).unwrap();
        h.controller
            .apply_intf_config(IntfConf::new(intf(), 24, AREA))
            .await
            .unwrap();
        h.controller.process_global_config(enabled()).await.unwrap();
        wire
    }

    #[tokio::test]
    async fn test_enable_spf_routes_then_disable_clears_everything() {
        let mut h = harness();
        h.controller.apply_area_config(AreaConf::new(AREA)).unwrap();
        h.controller.process_global_config(enabled()).await.unwrap();
        assert!(h.controller.is_running());

        let self_lsa = RouterLsa::new(
            ME,
            INITIAL_SEQUENCE_NUMBER,
            RouterLsaFlags::default(),
            vec![RouterLink::transit(NEIGHBOR_ADDR, LOCAL, 10)],
        );
        let network_lsa = NetworkLsa::new(NEIGHBOR_ADDR, NEIGHBOR, INITIAL_SEQUENCE_NUMBER, MASK, vec![ME, NEIGHBOR]);
        assert_eq!(h.controller.install_lsa(AREA, Lsa::Router(self_lsa)), Ok(UpsertOutcome::Inserted));
        assert_eq!(h.controller.install_lsa(AREA, Lsa::Network(network_lsa)), Ok(UpsertOutcome::Inserted));

        h.controller.run_spf().await;

        assert_eq!(h.controller.graph(AREA).unwrap().vertex_count(), 2);
        let tree = h.controller.spf_tree(AREA).unwrap();
        assert_eq!(tree.distance(&VertexKey::network(NEIGHBOR_ADDR, AREA)), Some(10));

        let table = h.controller.routing_table();
        assert_eq!(table.len(), 1);
        let route = table.sorted()[0].clone();
        assert_eq!(route.prefix, Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap());
        assert_eq!(route.cost, 10);
        assert_eq!(route.next_hops, BTreeSet::from([NextHop::new(LOCAL, NEIGHBOR_ADDR)]));
        assert_eq!(h.routes.recv().await, Some(RouteUpdate::Install(route.clone())));
        assert_eq!(h.controller.global().counters.spf_runs, 1);

        h.controller.process_global_config(disabled()).await.unwrap();
        assert!(!h.controller.is_running());
        assert!(h.controller.lsdb().area(AREA).is_none());
        assert!(h.controller.graph(AREA).is_none());
        assert!(h.controller.spf_tree(AREA).is_none());
        assert!(h.controller.routing_table().is_empty());
        assert_eq!(h.routes.recv().await, Some(RouteUpdate::Withdraw(route)));
    }

    /// Rejects the first `failures` installs.
    struct FlakyForwarder {
        failures: AtomicUsize,
        installed: Mutex<Vec<RouteEntry>>,
    }

    #[async_trait]
    impl ForwardingPlane for FlakyForwarder {
        async fn install_route(&self, route: &RouteEntry) -> Result<(), ForwardingError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ForwardingError::Unavailable("rib busy".to_string()));
            }
            self.installed.lock().unwrap().push(route.clone());
            Ok(())
        }

        async fn withdraw_route(&self, _route: &RouteEntry) -> Result<(), ForwardingError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejected_routes_are_pushed_again() {
        logging::init_for_tests();
        let (events_tx, _events_rx) = mpsc::channel(64);
        let forwarder = Arc::new(FlakyForwarder {
            failures: AtomicUsize::new(1),
            installed: Mutex::new(Vec::new()),
        });
        let mut controller = Controller::new(
            ControllerSettings::default(),
            forwarder.clone(),
            Arc::new(ChannelPacketIoProvider::new(64)),
            events_tx,
        );
        controller.apply_area_config(AreaConf::new(AREA)).unwrap();
        controller.process_global_config(enabled()).await.unwrap();

        let self_lsa = RouterLsa::new(
            ME,
            INITIAL_SEQUENCE_NUMBER,
            RouterLsaFlags::default(),
            vec![RouterLink::transit(NEIGHBOR_ADDR, LOCAL, 10)],
        );
        let network_lsa = NetworkLsa::new(NEIGHBOR_ADDR, NEIGHBOR, INITIAL_SEQUENCE_NUMBER, MASK, vec![ME, NEIGHBOR]);
        controller.install_lsa(AREA, Lsa::Router(self_lsa)).unwrap();
        controller.install_lsa(AREA, Lsa::Network(network_lsa)).unwrap();

        controller.run_spf().await;
        assert_eq!(controller.routing_table().len(), 1);
        assert!(forwarder.installed.lock().unwrap().is_empty());

        assert_eq!(controller.sync_forwarding().await, 0);
        assert_eq!(forwarder.installed.lock().unwrap().len(), 1);

        // Nothing pending: no second push.
        assert_eq!(controller.sync_forwarding().await, 0);
        assert_eq!(forwarder.installed.lock().unwrap().len(), 1);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_global_config_leaves_state_intact() {
        let mut h = harness();
        h.controller.apply_area_config(AreaConf::new(AREA)).unwrap();
        h.controller.process_global_config(enabled()).await.unwrap();

        let invalid = GlobalConf {
            router_id: RouterId::new(9, 9, 9, 9),
            reference_bandwidth: -1,
            ..enabled()
        };
        assert!(matches!(
            h.controller.process_global_config(invalid).await,
            Err(ConfigError::InvalidReferenceBandwidth(-1))
        ));
        assert!(h.controller.is_running());
        assert_eq!(h.controller.global().router_id(), ME);
        assert!(h.controller.lsdb().area(AREA).is_some());

        h.controller.shutdown().await;
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn test_interface_requires_configured_area() {
        let mut h = harness();
        let result = h
            .controller
            .apply_intf_config(IntfConf::new(intf(), 24, AreaId::new(0, 0, 0, 7)))
            .await;
        assert!(matches!(result, Err(ConfigError::UnknownArea(_))));
    }

    #[tokio::test]
    async fn test_enabled_interface_originates_stub_then_transit() {
        let mut h = harness();
        let _wire = with_interface(&mut h).await;
        assert_eq!(h.controller.running_interfaces(), vec![intf()]);

        let self_lsa = |c: &Controller| c.lsdb().area(AREA).and_then(|a| a.router_lsa_of(ME)).cloned().unwrap();
        let lsa = self_lsa(&h.controller);
        assert_eq!(lsa.links, vec![RouterLink::stub(Ipv4Addr::new(10, 0, 0, 0), MASK, 10)]);
        let first_seq = lsa.header.sequence_number;

        // The neighbor wins the election with the higher router id.
        h.controller.handle_neighbor_change(full_neighbor());
        let lsa = self_lsa(&h.controller);
        assert_eq!(lsa.links.len(), 1);
        assert_eq!(lsa.links[0].link_type, RouterLinkType::Transit);
        assert_eq!(lsa.links[0].link_id, NEIGHBOR_ADDR);
        assert_eq!(lsa.header.sequence_number, first_seq + 1);
        assert!(h.controller.lsdb().find_network_lsa(AREA, LOCAL).is_none());

        h.controller.handle_neighbor_change(NeighborChange {
            state: NeighborState::Down,
            ..full_neighbor()
        });
        let lsa = self_lsa(&h.controller);
        assert_eq!(lsa.links[0].link_type, RouterLinkType::Stub);

        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_lsa_at_max_sequence_number_wraps() {
        let mut h = harness();
        let _wire = with_interface(&mut h).await;
        let exhausted = RouterLsa::new(
            ME,
            MAX_SEQUENCE_NUMBER,
            RouterLsaFlags::default(),
            vec![RouterLink::stub(Ipv4Addr::new(10, 0, 0, 0), MASK, 10)],
        );
        h.controller.install_lsa(AREA, Lsa::Router(exhausted)).unwrap();

        h.controller.handle_neighbor_change(full_neighbor());
        let lsa = h.controller.lsdb().area(AREA).and_then(|a| a.router_lsa_of(ME)).cloned().unwrap();
        assert_eq!(lsa.header.sequence_number, INITIAL_SEQUENCE_NUMBER);
        assert_eq!(lsa.header.age, 0);
        assert_eq!(lsa.links[0].link_type, RouterLinkType::Transit);

        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_from_stopped_workers_are_dropped() {
        let mut h = harness();
        let _wire = with_interface(&mut h).await;
        let old_session = h.controller.session();
        let queued_full = ControlEvent::Neighbor {
            session: old_session,
            change: full_neighbor(),
        };

        h.controller.process_global_config(disabled()).await.unwrap();
        h.controller.process_global_config(enabled()).await.unwrap();
        assert_ne!(h.controller.session(), old_session);

        assert!(h.controller.handle_event(queued_full).await.is_continue());
        assert_eq!(h.controller.adjacencies().count(), 0);
        let lsa = h.controller.lsdb().area(AREA).and_then(|a| a.router_lsa_of(ME)).cloned().unwrap();
        assert!(lsa.links.iter().all(|link| link.link_type == RouterLinkType::Stub));

        let runs = h.controller.global().counters.spf_runs;
        h.controller.handle_event(ControlEvent::RunSpf(old_session)).await;
        assert_eq!(h.controller.global().counters.spf_runs, runs);

        // The same change from the running workers is applied.
        let current = ControlEvent::Neighbor {
            session: h.controller.session(),
            change: full_neighbor(),
        };
        h.controller.handle_event(current).await;
        assert_eq!(h.controller.adjacencies().count(), 1);

        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_designated_router_originates_network_lsa() {
        let mut h = harness();
        let _wire = with_interface(&mut h).await;

        let lower = NeighborChange {
            router_id: RouterId::new(0, 0, 0, 9),
            ..full_neighbor()
        };
        h.controller.handle_neighbor_change(lower.clone());
        let network = h.controller.lsdb().find_network_lsa(AREA, LOCAL).unwrap();
        assert_eq!(network.attached_routers, vec![RouterId::new(0, 0, 0, 9), ME]);

        // Losing the only adjacency flushes it.
        h.controller.handle_neighbor_change(NeighborChange {
            state: NeighborState::Down,
            ..lower
        });
        assert!(h.controller.lsdb().find_network_lsa(AREA, LOCAL).is_none());

        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_ls_update_requires_full_adjacency() {
        let mut h = harness();
        let _wire = with_interface(&mut h).await;

        let neighbor_lsa = RouterLsa::new(
            NEIGHBOR,
            INITIAL_SEQUENCE_NUMBER,
            RouterLsaFlags::default(),
            vec![RouterLink::transit(NEIGHBOR_ADDR, NEIGHBOR_ADDR, 10)],
        );
        let update = LsUpdate {
            router_id: NEIGHBOR,
            area: AREA,
            lsas: vec![Lsa::Router(neighbor_lsa)],
        };

        h.controller.handle_ls_update(intf(), NEIGHBOR_ADDR, update.clone());
        assert_eq!(h.controller.global().counters.rx_dropped_unknown_neighbor, 1);
        assert!(h.controller.lsdb().area(AREA).unwrap().router_lsa_of(NEIGHBOR).is_none());

        h.controller.handle_neighbor_change(full_neighbor());
        h.controller.handle_ls_update(intf(), NEIGHBOR_ADDR, update.clone());
        assert!(h.controller.lsdb().area(AREA).unwrap().router_lsa_of(NEIGHBOR).is_some());
        assert_eq!(h.controller.global().counters.rx_new_lsas, 1);

        // The same instance again changes nothing.
        h.controller.handle_ls_update(intf(), NEIGHBOR_ADDR, update);
        assert_eq!(h.controller.global().counters.rx_new_lsas, 1);

        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_incremental_install_matches_rebuild() {
        let mut h = harness();
        let _wire = with_interface(&mut h).await;
        h.controller.handle_neighbor_change(full_neighbor());
        h.controller.run_spf().await;

        let network_lsa = NetworkLsa::new(NEIGHBOR_ADDR, NEIGHBOR, INITIAL_SEQUENCE_NUMBER, MASK, vec![ME, NEIGHBOR]);
        h.controller.install_lsa(AREA, Lsa::Network(network_lsa)).unwrap();
        assert!(h.controller.lsdb().graph_dirty_areas().is_empty());

        let patched = h.controller.graph(AREA).unwrap().snapshot();
        let (rebuilt, _) = AreaGraph::build(h.controller.lsdb().area(AREA).unwrap());
        assert_eq!(patched, rebuilt.snapshot());

        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_aging_evicts_max_age_lsas() {
        let mut h = harness();
        h.controller.apply_area_config(AreaConf::new(AREA)).unwrap();
        h.controller.process_global_config(enabled()).await.unwrap();

        let mut old = RouterLsa::new(NEIGHBOR, INITIAL_SEQUENCE_NUMBER, RouterLsaFlags::default(), vec![]);
        old.header.age = MAX_AGE - 1;
        h.controller.install_lsa(AREA, Lsa::Router(old)).unwrap();

        h.controller.age_lsdb(Duration::from_millis(600));
        assert_eq!(h.controller.lsdb().area(AREA).unwrap().len(), 1);
        h.controller.age_lsdb(Duration::from_millis(600));
        assert_eq!(h.controller.lsdb().area(AREA).unwrap().len(), 0);

        h.controller.shutdown().await;
    }
}
