//! K-bucket routing table.

mod bigint;
mod bucket;
mod heap;
mod table;

pub use heap::NodeHeap;
pub use table::{Pinger, RoutingTable};
