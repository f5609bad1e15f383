/*!
Interface workers.

Each enabled interface runs one loop over its `PacketIo`: received packets go
to the shared packet-RX worker, commands from the control loop are sent out,
and a hello is multicast every hello interval. The packet-RX worker checks
the area of every received packet and dispatches hellos to the neighbor FSM
and LS updates to the control loop.
*/

use std::{collections::BTreeMap, net::Ipv4Addr};

use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    config::IntfConf,
    network::{
        packet::{Hello, InboundPacket, OspfPacket},
        router::{AreaId, IntfKey, RouterId},
    },
    server::{
        events::{ControlEvent, InterfaceCommand, NeighborInput, Session},
        shutdown::{ShutdownToken, wait_for_stop},
    },
    topology::source::{ALL_SPF_ROUTERS, PacketIo},
};

/// Handle the control loop keeps for a running interface.
pub struct InterfaceWorker {
    pub key: IntfKey,
    pub area: AreaId,
    commands: mpsc::Sender<InterfaceCommand>,
    token: ShutdownToken,
}

impl InterfaceWorker {
    /// Queues a packet without waiting; returns `false` if it was dropped.
    pub fn try_send(&self, destination: Ipv4Addr, packet: OspfPacket) -> bool {
        match self.commands.try_send(InterfaceCommand::Send { destination, packet }) {
            Ok(()) => true,
            Err(e) => {
                warn!(intf = %self.key, error = %e, "interface command dropped");
                false
            }
        }
    }

    pub async fn stop(mut self) {
        self.token.stop().await;
        info!(intf = %self.key, "interface stopped");
    }
}

/// Spawns the RX/TX loop of one interface.
pub fn spawn_interface(
    conf: IntfConf,
    router_id: RouterId,
    io: Box<dyn PacketIo>,
    inbound: mpsc::Sender<InboundPacket>,
    capacity: usize,
) -> InterfaceWorker {
    let (commands, commands_rx) = mpsc::channel(capacity.max(1));
    let mut token = ShutdownToken::new(format!("interface {}", conf.key));
    let key = conf.key;
    let area = conf.area_id;
    let stop = token.subscribe();
    token.add_task(tokio::spawn(run_interface(conf, router_id, io, inbound, commands_rx, stop)));
    info!(intf = %key, area = %area, "interface started");
    InterfaceWorker {
        key,
        area,
        commands,
        token,
    }
}

fn hello_packet(conf: &IntfConf, router_id: RouterId, heard: &BTreeMap<RouterId, Instant>) -> OspfPacket {
    OspfPacket::Hello(Hello {
        router_id,
        area: conf.area_id,
        network_mask: conf.mask(),
        hello_interval: conf.hello_interval,
        dead_interval: conf.dead_interval,
        priority: conf.priority,
        neighbors: heard.keys().copied().collect(),
    })
}

async fn run_interface(
    conf: IntfConf,
    router_id: RouterId,
    io: Box<dyn PacketIo>,
    inbound: mpsc::Sender<InboundPacket>,
    mut commands: mpsc::Receiver<InterfaceCommand>,
    mut stop: watch::Receiver<bool>,
) {
    let mut hello_timer = interval(conf.hello_interval);
    hello_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Routers whose hellos we saw recently, echoed back in our own hellos.
    let mut heard: BTreeMap<RouterId, Instant> = BTreeMap::new();

    loop {
        let outgoing = tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            received = io.recv() => {
                let Some((source, packet)) = received else {
                    warn!(intf = %conf.key, "packet source closed");
                    break;
                };
                if let OspfPacket::Hello(hello) = &packet {
                    heard.insert(hello.router_id, Instant::now());
                }
                let packet = InboundPacket {
                    intf: conf.key,
                    area: conf.area_id,
                    source,
                    packet,
                };
                tokio::select! {
                    _ = wait_for_stop(&mut stop) => break,
                    sent = inbound.send(packet) => {
                        if sent.is_err() {
                            debug!(intf = %conf.key, "packet rx worker gone, packet dropped");
                        }
                    }
                }
                None
            }
            command = commands.recv() => match command {
                Some(InterfaceCommand::Send { destination, packet }) => Some((destination, packet)),
                None => break,
            },
            _ = hello_timer.tick() => {
                let now = Instant::now();
                heard.retain(|_, seen| now.duration_since(*seen) <= conf.dead_interval);
                Some((ALL_SPF_ROUTERS, hello_packet(&conf, router_id, &heard)))
            }
        };

        if let Some((destination, packet)) = outgoing {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => break,
                sent = io.send(destination, packet) => {
                    if let Err(e) = sent {
                        warn!(intf = %conf.key, error = %e, "send failed");
                    }
                }
            }
        }
    }
    debug!(intf = %conf.key, "interface loop stopped");
}

/// Packet-RX worker: validates the area and dispatches by packet type.
pub async fn run_packet_rx(
    router_id: RouterId,
    session: Session,
    mut inbound: mpsc::Receiver<InboundPacket>,
    neighbors: mpsc::Sender<NeighborInput>,
    events: mpsc::Sender<ControlEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        if packet.packet.router_id() == router_id {
            continue;
        }
        if packet.packet.area() != packet.area {
            warn!(
                intf = %packet.intf,
                source = %packet.source,
                area = %packet.packet.area(),
                expected = %packet.area,
                "packet for a different area dropped"
            );
            continue;
        }

        let delivered = match packet.packet {
            OspfPacket::Hello(hello) => {
                let input = NeighborInput::Hello {
                    intf: packet.intf,
                    source: packet.source,
                    hello,
                };
                tokio::select! {
                    _ = wait_for_stop(&mut stop) => break,
                    sent = neighbors.send(input) => sent.is_ok(),
                }
            }
            OspfPacket::LsUpdate(update) => {
                let event = ControlEvent::LsUpdate {
                    session: Some(session),
                    intf: packet.intf,
                    source: packet.source,
                    update,
                };
                tokio::select! {
                    _ = wait_for_stop(&mut stop) => break,
                    sent = events.send(event) => sent.is_ok(),
                }
            }
        };
        if !delivered {
            warn!("packet rx consumer gone, exiting");
            break;
        }
    }
    debug!("packet rx stopped");
}
