/*!
Protocol data model: identifiers, decoded LSA and packet shapes, and the
per-area topology graph built from them.
*/

pub mod edge;
pub mod lsa;
pub mod network_graph;
pub mod node;
pub mod packet;
pub mod router;
