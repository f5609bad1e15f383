/*!
Neighbor workers.

`run_neighbor_fsm` owns the neighbor table: hellos move a neighbor to Full once
it lists this router (two-way), silence longer than the dead interval or an
interface going down drops it. Every transition into or out of Full is
reported to the control loop as a `NeighborChange`.

`run_neighbor_conf` applies interface config changes to the FSM, so the FSM
only ever sees interface parameters through its input queue.
*/

use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    network::{
        packet::Hello,
        router::{AreaId, IntfKey, RouterId},
    },
    server::{
        events::{
            ControlEvent, NeighborChange, NeighborConfUpdate, NeighborInput, NeighborIntfConf, NeighborState, Session,
        },
        shutdown::wait_for_stop,
    },
};

/// How often the FSM looks for neighbors past their dead interval.
pub const DEAD_CHECK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct NeighborRecord {
    area: AreaId,
    address: Ipv4Addr,
    priority: u8,
    state: NeighborState,
    dead_interval: Duration,
    last_heard: Instant,
}

impl NeighborRecord {
    fn change(&self, intf: IntfKey, router_id: RouterId, state: NeighborState) -> NeighborChange {
        NeighborChange {
            intf,
            area: self.area,
            router_id,
            address: self.address,
            priority: self.priority,
            state,
        }
    }
}

/// The neighbor table and its transitions, free of any I/O.
#[derive(Debug, Default)]
pub struct NeighborTable {
    router_id: RouterId,
    intfs: BTreeMap<IntfKey, NeighborIntfConf>,
    neighbors: BTreeMap<(IntfKey, RouterId), NeighborRecord>,
}

impl NeighborTable {
    pub fn new(router_id: RouterId) -> Self {
        Self {
            router_id,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn state(&self, intf: IntfKey, router_id: RouterId) -> Option<NeighborState> {
        self.neighbors.get(&(intf, router_id)).map(|record| record.state)
    }

    /// Processes one input, returning the Full/Down transitions it caused.
    pub fn handle(&mut self, input: NeighborInput, now: Instant) -> Vec<NeighborChange> {
        match input {
            NeighborInput::Hello { intf, source, hello } => self.hello(intf, source, hello, now).into_iter().collect(),
            NeighborInput::IntfUp(conf) => {
                debug!(intf = %conf.intf, area = %conf.area, "neighbor interface up");
                self.intfs.insert(conf.intf, conf);
                Vec::new()
            }
            NeighborInput::IntfDown(intf) => {
                self.intfs.remove(&intf);
                self.remove_where(|(key, _)| *key == intf)
            }
        }
    }

    fn hello(&mut self, intf: IntfKey, source: Ipv4Addr, hello: Hello, now: Instant) -> Option<NeighborChange> {
        if hello.router_id == self.router_id {
            return None;
        }
        if let Some(conf) = self.intfs.get(&intf) {
            if conf.area != hello.area
                || conf.hello_interval != hello.hello_interval
                || conf.dead_interval != hello.dead_interval
            {
                warn!(
                    intf = %intf,
                    neighbor = %hello.router_id,
                    area = %hello.area,
                    "hello parameters do not match the interface, dropped"
                );
                return None;
            }
        }

        let two_way = hello.neighbors.contains(&self.router_id);
        let key = (intf, hello.router_id);
        let record = self.neighbors.entry(key).or_insert_with(|| {
            debug!(intf = %intf, neighbor = %hello.router_id, "new neighbor");
            NeighborRecord {
                area: hello.area,
                address: source,
                priority: hello.priority,
                state: NeighborState::Init,
                dead_interval: hello.dead_interval,
                last_heard: now,
            }
        });
        record.address = source;
        record.priority = hello.priority;
        record.dead_interval = hello.dead_interval;
        record.last_heard = now;

        match (record.state, two_way) {
            (NeighborState::Full, true) => None,
            (_, true) => {
                record.state = NeighborState::Full;
                info!(intf = %intf, neighbor = %hello.router_id, address = %source, "adjacency full");
                Some(record.change(intf, hello.router_id, NeighborState::Full))
            }
            (NeighborState::Full, false) => {
                record.state = NeighborState::Init;
                info!(intf = %intf, neighbor = %hello.router_id, "neighbor no longer sees us");
                Some(record.change(intf, hello.router_id, NeighborState::Down))
            }
            (_, false) => None,
        }
    }

    /// Drops neighbors not heard from within their dead interval.
    pub fn expire(&mut self, now: Instant) -> Vec<NeighborChange> {
        self.remove_where(|(_, record)| now.duration_since(record.last_heard) > record.dead_interval)
    }

    fn remove_where(
        &mut self,
        mut predicate: impl FnMut((&IntfKey, &NeighborRecord)) -> bool,
    ) -> Vec<NeighborChange> {
        let doomed: Vec<(IntfKey, RouterId)> = self
            .neighbors
            .iter()
            .filter(|&(key, record)| predicate((&key.0, record)))
            .map(|(key, _)| *key)
            .collect();

        let mut changes = Vec::new();
        for (intf, router_id) in doomed {
            let Some(record) = self.neighbors.remove(&(intf, router_id)) else {
                continue;
            };
            info!(intf = %intf, neighbor = %router_id, "neighbor down");
            if record.state == NeighborState::Full {
                changes.push(record.change(intf, router_id, NeighborState::Down));
            }
        }
        changes
    }
}

/// Neighbor FSM worker.
pub async fn run_neighbor_fsm(
    router_id: RouterId,
    session: Session,
    mut inputs: mpsc::Receiver<NeighborInput>,
    events: mpsc::Sender<ControlEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut table = NeighborTable::new(router_id);
    let mut dead_check = interval(DEAD_CHECK_PERIOD);
    dead_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let changes = tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            input = inputs.recv() => match input {
                Some(input) => table.handle(input, Instant::now()),
                None => break,
            },
            _ = dead_check.tick() => table.expire(Instant::now()),
        };

        for change in changes {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => {
                    debug!("neighbor fsm stopped");
                    return;
                }
                sent = events.send(ControlEvent::Neighbor { session, change }) => {
                    if sent.is_err() {
                        warn!("control loop gone, neighbor fsm exiting");
                        return;
                    }
                }
            }
        }
    }
    debug!(neighbors = table.len(), "neighbor fsm stopped");
}

/// Neighbor-conf worker: forwards interface config changes to the FSM.
pub async fn run_neighbor_conf(
    mut updates: mpsc::Receiver<NeighborConfUpdate>,
    fsm: mpsc::Sender<NeighborInput>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let input = tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            update = updates.recv() => match update {
                Some(NeighborConfUpdate::IntfUp(conf)) => NeighborInput::IntfUp(conf),
                Some(NeighborConfUpdate::IntfDown(intf)) => NeighborInput::IntfDown(intf),
                None => break,
            },
        };
        tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            sent = fsm.send(input) => {
                if sent.is_err() {
                    warn!("neighbor fsm gone, neighbor conf exiting");
                    break;
                }
            }
        }
    }
    debug!("neighbor conf stopped");
}
