//! The routing table: an ordered, contiguous sequence of k-buckets covering
//! the full 160-bit key space.
//!
//! Routing needs to ping stale bucket heads; the protocol layer owns the RPC
//! transport needed to do that. Rather than a cyclic reference between the
//! two, the table is handed a narrow `Pinger` capability at construction and
//! calls through it.

use super::bucket::{AddOutcome, KBucket};
use super::heap::NodeHeap;
use crate::identity::NodeId;
use crate::node::NodeContact;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A single-method capability: "ping this node, and if it doesn't answer,
/// remove it from the routing table." Implemented by the protocol layer,
/// which has the RPC transport the table itself does not.
pub trait Pinger: Send + Sync {
    fn ping_and_evict_on_timeout(&self, node: NodeContact);
}

pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Mutex<Vec<KBucket>>,
    pinger: Arc<dyn Pinger>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize, pinger: Arc<dyn Pinger>) -> Self {
        let full_range = KBucket::new(NodeId([0u8; 20]), NodeId([0xffu8; 20]), k);
        Self {
            local_id,
            k,
            buckets: Mutex::new(vec![full_range]),
            pinger,
        }
    }

    fn bucket_index_for(buckets: &[KBucket], id: &NodeId) -> usize {
        buckets
            .iter()
            .position(|b| b.has_in_range(id))
            .expect("bucket ranges must partition the key space")
    }

    /// Attempt to add `node`. On a full, non-splittable bucket, drops this
    /// attempt and fires a best-effort ping at the bucket head instead; a
    /// future call (once the head is evicted or confirmed live) resolves
    /// the slot.
    pub fn add_contact(&self, node: NodeContact) {
        if node.id == self.local_id {
            return;
        }
        let mut buckets = self.buckets.lock().expect("routing table mutex poisoned");
        self.add_contact_locked(&mut buckets, node);
    }

    fn add_contact_locked(&self, buckets: &mut Vec<KBucket>, node: NodeContact) {
        let idx = Self::bucket_index_for(buckets, &node.id);
        match buckets[idx].add(node) {
            AddOutcome::Added => {}
            AddOutcome::Queued => {
                let covers_local = buckets[idx].has_in_range(&self.local_id);
                let depth_splits = buckets[idx].depth() % 5 != 0;
                if covers_local || depth_splits {
                    let bucket = buckets.remove(idx);
                    let (lower, upper) = bucket.split();
                    buckets.insert(idx, upper);
                    buckets.insert(idx, lower);
                    self.add_contact_locked(buckets, node);
                } else if let Some(head) = buckets[idx].head() {
                    self.pinger.ping_and_evict_on_timeout(head);
                }
            }
        }
    }

    pub fn remove_contact(&self, id: &NodeId) {
        let mut buckets = self.buckets.lock().expect("routing table mutex poisoned");
        let idx = Self::bucket_index_for(&buckets, id);
        buckets[idx].remove(id);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let buckets = self.buckets.lock().expect("routing table mutex poisoned");
        let idx = Self::bucket_index_for(&buckets, id);
        buckets[idx].contacts().any(|n| n.id == *id)
    }

    /// Nearest `k` contacts to `target`, excluding `target` itself and any
    /// contact same-home as `exclude`.
    pub fn find_neighbors(
        &self,
        target: &NodeId,
        k: Option<usize>,
        exclude: Option<&NodeContact>,
    ) -> Vec<NodeContact> {
        let cap = k.unwrap_or(self.k);
        let mut buckets = self.buckets.lock().expect("routing table mutex poisoned");
        let start = Self::bucket_index_for(&buckets, target);
        let mut heap = NodeHeap::new(*target, cap);
        let len = buckets.len() as isize;

        let collect = |bucket: &mut KBucket, heap: &mut NodeHeap| {
            bucket.touch_last_updated();
            for contact in bucket.contacts() {
                if contact.id == *target {
                    continue;
                }
                if let Some(ex) = exclude {
                    if contact.same_home(ex) {
                        continue;
                    }
                }
                heap.push(*contact);
            }
        };

        collect(&mut buckets[start], &mut heap);

        let mut left = start as isize - 1;
        let mut right = start as isize + 1;
        let mut go_left = true;
        while heap.len() < cap && (left >= 0 || right < len) {
            let next = if go_left {
                if left >= 0 {
                    let idx = left;
                    left -= 1;
                    Some(idx)
                } else if right < len {
                    let idx = right;
                    right += 1;
                    Some(idx)
                } else {
                    None
                }
            } else if right < len {
                let idx = right;
                right += 1;
                Some(idx)
            } else if left >= 0 {
                let idx = left;
                left -= 1;
                Some(idx)
            } else {
                None
            };
            go_left = !go_left;
            match next {
                Some(idx) => collect(&mut buckets[idx as usize], &mut heap),
                None => break,
            }
        }
        heap.visible()
    }

    /// Buckets not touched within the last hour.
    pub fn lonely_buckets(&self) -> Vec<(NodeId, NodeId)> {
        let buckets = self.buckets.lock().expect("routing table mutex poisoned");
        let cutoff = Duration::from_secs(3600);
        let now = Instant::now();
        buckets
            .iter()
            .filter(|b| now.duration_since(b.last_updated()) > cutoff)
            .map(|b| (b.lo, b.hi))
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("routing table mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPinger;
    impl Pinger for NoopPinger {
        fn ping_and_evict_on_timeout(&self, _node: NodeContact) {}
    }

    struct CountingPinger(Mutex<usize>);
    impl Pinger for CountingPinger {
        fn ping_and_evict_on_timeout(&self, _node: NodeContact) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn table(local_id: NodeId) -> RoutingTable {
        RoutingTable::new(local_id, 4, Arc::new(NoopPinger))
    }

    fn contact(byte: u8) -> NodeContact {
        NodeContact::new(NodeId([byte; 20]), ([127, 0, 0, 1], byte as u16 + 2000).into())
    }

    #[test]
    fn empty_table_has_no_neighbors() {
        let t = table(NodeId([0u8; 20]));
        assert!(t.find_neighbors(&NodeId([1u8; 20]), None, None).is_empty());
    }

    #[test]
    fn bucket_splits_when_it_covers_local_id() {
        let local = NodeId([0u8; 20]);
        let t = table(local);
        // local bucket covers everything initially, so overflow always splits
        for i in 1..=10u8 {
            t.add_contact(contact(i));
        }
        assert!(t.bucket_count() > 1);
    }

    #[test]
    fn added_contact_is_found_via_find_neighbors() {
        let local = NodeId([0u8; 20]);
        let t = table(local);
        let c = contact(5);
        t.add_contact(c);
        let neighbors = t.find_neighbors(&c.id, None, None);
        assert!(neighbors.iter().any(|n| n.id == c.id));
    }

    #[test]
    fn find_neighbors_excludes_same_home_as_exclude() {
        let local = NodeId([0u8; 20]);
        let t = table(local);
        let c = contact(5);
        t.add_contact(c);
        let exclude = NodeContact::new(NodeId([99u8; 20]), c.addr);
        let neighbors = t.find_neighbors(&NodeId([6u8; 20]), None, Some(&exclude));
        assert!(neighbors.is_empty());
    }
}
