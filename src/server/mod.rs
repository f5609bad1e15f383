/*!
The OSPF control loop and its workers.

`OspfServer::spawn` starts the control loop task, which owns a `Controller`
and serializes every config apply, received LS update, adjacency change, SPF
run and query. `ControlHandle` is the cloneable front end used by the binary
and by tests.
*/

pub mod controller;
pub mod events;
pub mod interface;
pub mod neighbor;
pub mod origination;
pub mod shutdown;
pub mod spf_scheduler;

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::info;

pub use controller::{Controller, ControllerSettings};
pub use events::{ControlEvent, Query};

use crate::{
    config::{AreaConf, ConfigError, GlobalConf, GlobalState, IntfConf},
    network::{
        node::VertexKey,
        packet::LsUpdate,
        router::{AreaId, IntfKey},
    },
    topology::{
        forwarding::ForwardingPlane,
        routing_table::GlobalRoutingTbl,
        source::PacketIoProvider,
        spf::SpfTree,
        store::{LsaDumpEntry, LsdbError, LsdbSummary},
    },
};

const MIN_AGE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("control loop is not running")]
    ChannelClosed,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lsdb(#[from] LsdbError),
}

/// Cloneable front end of a running control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlEvent>,
}

impl ControlHandle {
    async fn request<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> ControlEvent) -> Result<T, ServerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(event(reply))
            .await
            .map_err(|_| ServerError::ChannelClosed)?;
        response.await.map_err(|_| ServerError::ChannelClosed)
    }

    pub async fn apply_global(&self, conf: GlobalConf) -> Result<(), ServerError> {
        self.request(|reply| ControlEvent::ApplyGlobal { conf, reply }).await??;
        Ok(())
    }

    pub async fn apply_area(&self, conf: AreaConf) -> Result<(), ServerError> {
        self.request(|reply| ControlEvent::ApplyArea { conf, reply }).await??;
        Ok(())
    }

    pub async fn apply_intf(&self, conf: IntfConf) -> Result<(), ServerError> {
        self.request(|reply| ControlEvent::ApplyIntf { conf, reply }).await??;
        Ok(())
    }

    pub async fn routing_table(&self) -> Result<GlobalRoutingTbl, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::RoutingTable(reply))).await
    }

    pub async fn dump_routing_table(&self) -> Result<String, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::DumpRoutingTable(reply))).await
    }

    pub async fn lsdb_summary(&self) -> Result<LsdbSummary, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::LsdbSummary(reply))).await
    }

    pub async fn dump_lsdb(&self, area: AreaId) -> Result<Vec<LsaDumpEntry>, ServerError> {
        Ok(self
            .request(|reply| ControlEvent::Query(Query::DumpLsdb(area, reply)))
            .await??)
    }

    pub async fn dump_external_lsdb(&self) -> Result<Vec<LsaDumpEntry>, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::DumpExternalLsdb(reply))).await
    }

    pub async fn dump_graph(&self, area: AreaId) -> Result<Option<String>, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::DumpGraph(area, reply))).await
    }

    /// `None` when the area has no graph or the graph has no such vertex.
    pub async fn dump_vertex(&self, area: AreaId, key: VertexKey) -> Result<Option<String>, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::DumpVertex(area, key, reply))).await
    }

    pub async fn spf_tree(&self, area: AreaId) -> Result<Option<SpfTree>, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::SpfTree(area, reply))).await
    }

    pub async fn global_state(&self) -> Result<GlobalState, ServerError> {
        self.request(|reply| ControlEvent::Query(Query::GlobalState(reply))).await
    }

    /// Hands an LS update to the control loop as if it arrived on `intf`.
    pub async fn ls_update(&self, intf: IntfKey, source: Ipv4Addr, update: LsUpdate) -> Result<(), ServerError> {
        self.tx
            .send(ControlEvent::LsUpdate {
                session: None,
                intf,
                source,
                update,
            })
            .await
            .map_err(|_| ServerError::ChannelClosed)
    }

    /// Disables the instance, joins every worker and ends the control loop.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.request(|reply| ControlEvent::Shutdown { reply }).await
    }
}

pub struct OspfServer;

impl OspfServer {
    /// Starts the control loop. The instance stays disabled until a global
    /// config enabling it is applied.
    pub fn spawn(
        settings: ControllerSettings,
        forwarder: Arc<dyn ForwardingPlane>,
        packet_io: Arc<dyn PacketIoProvider>,
    ) -> (ControlHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let age_tick = settings.timers.lsa_age_tick.max(MIN_AGE_TICK);
        let controller = Controller::new(settings, forwarder, packet_io, tx.clone());
        let task = tokio::spawn(run_control_loop(controller, rx, age_tick));
        (ControlHandle { tx }, task)
    }
}

async fn run_control_loop(mut controller: Controller, mut events: mpsc::Receiver<ControlEvent>, age_tick: Duration) {
    let mut aging = interval_at(Instant::now() + age_tick, age_tick);
    aging.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_aged = Instant::now();

    info!("control loop started");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if controller.handle_event(event).await.is_break() {
                    break;
                }
            }
            _ = aging.tick() => {
                let now = Instant::now();
                controller.age_lsdb(now - last_aged);
                last_aged = now;
                controller.sync_forwarding().await;
            }
        }
    }
    info!("control loop stopped");
}
