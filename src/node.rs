//! `NodeRef`: the (id, address) triple routing and RPC pass around by value.

use crate::identity::{Distance, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A reference to a remote peer: identifier plus where to reach it.
///
/// Carries no lifetime of its own; it is a plain value, copied freely
/// between the routing table, the spider's heap, and RPC payloads.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NodeContact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeContact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Two refs are "same-home" iff their host and port match. Used to
    /// exclude the sender of `find_node`/`find_value` from its own results
    /// without relying on matching ids.
    pub fn same_home(&self, other: &NodeContact) -> bool {
        self.addr == other.addr
    }

    pub fn distance(&self, target: &NodeId) -> Distance {
        self.id.distance(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id_byte: u8, port: u16) -> NodeContact {
        NodeContact::new(NodeId([id_byte; 20]), ([127, 0, 0, 1], port).into())
    }

    #[test]
    fn same_home_ignores_id() {
        let a = contact(1, 9000);
        let b = contact(2, 9000);
        assert!(a.same_home(&b));
    }

    #[test]
    fn different_port_is_not_same_home() {
        let a = contact(1, 9000);
        let b = contact(1, 9001);
        assert!(!a.same_home(&b));
    }
}
