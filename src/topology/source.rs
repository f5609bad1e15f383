/*!
Packet I/O collaborator interface.

This module defines:
- `PacketIoError`: error type for opening or using an interface socket.
- `PacketIo`: an async trait that receives already-decoded OSPF packets on one
  interface and sends outgoing ones.
- `PacketIoProvider`: opens a `PacketIo` per interface.
- `ChannelPacketIo`/`ChannelPacketIoProvider`: in-memory implementation over
  bounded channels, used by tests and by the daemon when no socket layer is wired in.

Adapters for real sockets should implement `PacketIoProvider` and hide the
wire encoding from the protocol core.
*/

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::network::{packet::OspfPacket, router::IntfKey};

/// OSPF packets are sent to AllSPFRouters unless a unicast peer is known.
pub const ALL_SPF_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketIoError {
    #[error("interface {0} is not available")]
    NoSuchInterface(IntfKey),
    #[error("interface {0} is closed")]
    Closed(IntfKey),
}

/// One interface worth of decoded packet I/O.
#[async_trait]
pub trait PacketIo: Send + Sync {
    /// Next packet and its source address, `None` once the interface is gone.
    async fn recv(&self) -> Option<(Ipv4Addr, OspfPacket)>;

    async fn send(&self, destination: Ipv4Addr, packet: OspfPacket) -> Result<(), PacketIoError>;
}

#[async_trait]
pub trait PacketIoProvider: Send + Sync {
    async fn open(&self, intf: IntfKey) -> Result<Box<dyn PacketIo>, PacketIoError>;
}

/// In-memory packet I/O for one interface.
#[derive(Clone)]
pub struct ChannelPacketIo {
    intf: IntfKey,
    inbound: Arc<AsyncMutex<mpsc::Receiver<(Ipv4Addr, OspfPacket)>>>,
    outbound: mpsc::Sender<(Ipv4Addr, OspfPacket)>,
}

#[async_trait]
impl PacketIo for ChannelPacketIo {
    async fn recv(&self) -> Option<(Ipv4Addr, OspfPacket)> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, destination: Ipv4Addr, packet: OspfPacket) -> Result<(), PacketIoError> {
        self.outbound
            .send((destination, packet))
            .await
            .map_err(|_| PacketIoError::Closed(self.intf))
    }
}

/// The far side of an attached in-memory interface: inject packets as if they
/// arrived from the wire, read what the daemon sent.
pub struct WireEnd {
    pub inject: mpsc::Sender<(Ipv4Addr, OspfPacket)>,
    pub sent: mpsc::Receiver<(Ipv4Addr, OspfPacket)>,
}

/// Hands out `ChannelPacketIo`s for interfaces attached beforehand.
///
/// Reopening an interface returns the same queues, so an interface survives
/// being stopped and started again.
#[derive(Default)]
pub struct ChannelPacketIoProvider {
    capacity: usize,
    interfaces: Mutex<HashMap<IntfKey, ChannelPacketIo>>,
}

impl ChannelPacketIoProvider {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            interfaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach(&self, intf: IntfKey) -> WireEnd {
        let (inject, inbound) = mpsc::channel(self.capacity.max(1));
        let (outbound, sent) = mpsc::channel(self.capacity.max(1));
        let io = ChannelPacketIo {
            intf,
            inbound: Arc::new(AsyncMutex::new(inbound)),
            outbound,
        };
        if let Ok(mut interfaces) = self.interfaces.lock() {
            interfaces.insert(intf, io);
        }
        WireEnd { inject, sent }
    }
}

#[async_trait]
impl PacketIoProvider for ChannelPacketIoProvider {
    async fn open(&self, intf: IntfKey) -> Result<Box<dyn PacketIo>, PacketIoError> {
        let interfaces = self
            .interfaces
            .lock()
            .map_err(|_| PacketIoError::NoSuchInterface(intf))?;
        interfaces
            .get(&intf)
            .cloned()
            .map(|io| Box::new(io) as Box<dyn PacketIo>)
            .ok_or(PacketIoError::NoSuchInterface(intf))
    }
}
