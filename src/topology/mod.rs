/*!
Topology module

This module holds the computational core that turns link-state advertisements
into forwarding decisions, plus the collaborator interfaces it talks through.

Structure:
- `store`: the link-state database (`Lsdb`), per-area Router/Network/Summary
           LSAs and AS-wide externals, with sequence-number acceptance and aging.
- `spf`: Dijkstra over an `AreaGraph`, producing an `SpfTree` with ECMP next hops.
- `routing_table`: route candidates from every area's tree and their
                   consolidation into the `GlobalRoutingTbl`.
- `forwarding`: the `ForwardingPlane` trait routes are pushed into.
- `source`: the `PacketIo` traits decoded packets come from.

Re-exports:
- `Lsdb`, `SpfTree`, `GlobalRoutingTbl` and the two collaborator traits.
*/

pub mod forwarding;
pub mod routing_table;
pub mod source;
pub mod spf;
pub mod store;

pub use forwarding::ForwardingPlane;
pub use routing_table::GlobalRoutingTbl;
pub use source::{PacketIo, PacketIoProvider};
pub use spf::SpfTree;
pub use store::Lsdb;
