/*!
Messages exchanged between the control loop and its workers.

Everything the control loop consumes arrives as a `ControlEvent`. Replies to
config applies and queries travel back on `oneshot` channels.
*/

use std::{net::Ipv4Addr, time::Duration};

use tokio::sync::oneshot;

use crate::{
    config::{AreaConf, ConfigError, GlobalConf, GlobalState, IntfConf},
    network::{
        node::VertexKey,
        packet::{Hello, LsUpdate, OspfPacket},
        router::{AreaId, IntfKey, RouterId},
    },
    topology::{
        routing_table::GlobalRoutingTbl,
        spf::SpfTree,
        store::{LsaDumpEntry, LsdbError, LsdbSummary},
    },
};

pub type ConfigReply = oneshot::Sender<Result<(), ConfigError>>;

/// One start of the protocol workers. Worker events carry the session they
/// were posted in, and the control loop drops those of an earlier one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Session(pub u64);

impl Session {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

#[derive(Debug)]
pub enum ControlEvent {
    ApplyGlobal { conf: GlobalConf, reply: ConfigReply },
    ApplyArea { conf: AreaConf, reply: ConfigReply },
    ApplyIntf { conf: IntfConf, reply: ConfigReply },
    /// An LS Update received on `intf` from `source`. `session` is `None`
    /// for updates handed in through the control handle.
    LsUpdate {
        session: Option<Session>,
        intf: IntfKey,
        source: Ipv4Addr,
        update: LsUpdate,
    },
    Neighbor { session: Session, change: NeighborChange },
    /// Posted by the SPF scheduler once a burst of triggers has settled.
    RunSpf(Session),
    Query(Query),
    Shutdown { reply: oneshot::Sender<()> },
}

/// Read-only requests; none of them mutates control loop state.
#[derive(Debug)]
pub enum Query {
    RoutingTable(oneshot::Sender<GlobalRoutingTbl>),
    DumpRoutingTable(oneshot::Sender<String>),
    LsdbSummary(oneshot::Sender<LsdbSummary>),
    DumpLsdb(AreaId, oneshot::Sender<Result<Vec<LsaDumpEntry>, LsdbError>>),
    DumpExternalLsdb(oneshot::Sender<Vec<LsaDumpEntry>>),
    /// Graphviz rendering of an area graph, `None` if the area has none.
    DumpGraph(AreaId, oneshot::Sender<Option<String>>),
    /// One vertex of an area graph with its outgoing edges.
    DumpVertex(AreaId, VertexKey, oneshot::Sender<Option<String>>),
    SpfTree(AreaId, oneshot::Sender<Option<SpfTree>>),
    GlobalState(oneshot::Sender<GlobalState>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NeighborState {
    Down,
    Init,
    Full,
}

/// Adjacency transition reported by the neighbor FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborChange {
    pub intf: IntfKey,
    pub area: AreaId,
    pub router_id: RouterId,
    pub address: Ipv4Addr,
    pub priority: u8,
    pub state: NeighborState,
}

/// Input of the neighbor FSM worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborInput {
    Hello {
        intf: IntfKey,
        source: Ipv4Addr,
        hello: Hello,
    },
    IntfUp(NeighborIntfConf),
    IntfDown(IntfKey),
}

/// Per-interface parameters a hello has to agree with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborIntfConf {
    pub intf: IntfKey,
    pub area: AreaId,
    pub hello_interval: Duration,
    pub dead_interval: Duration,
}

impl From<&IntfConf> for NeighborIntfConf {
    fn from(conf: &IntfConf) -> Self {
        Self {
            intf: conf.key,
            area: conf.area_id,
            hello_interval: conf.hello_interval,
            dead_interval: conf.dead_interval,
        }
    }
}

/// Commands from the control loop to the neighbor-conf worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborConfUpdate {
    IntfUp(NeighborIntfConf),
    IntfDown(IntfKey),
}

/// Commands from the control loop to one interface's TX side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceCommand {
    Send { destination: Ipv4Addr, packet: OspfPacket },
}
