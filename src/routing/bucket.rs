//! A single k-bucket: a bounded, range-scoped list of known peers.

use super::bigint;
use crate::identity::{NodeId, ID_BYTES};
use crate::node::NodeContact;
use std::collections::VecDeque;
use std::time::Instant;

pub struct KBucket {
    pub lo: NodeId,
    pub hi: NodeId,
    main: VecDeque<NodeContact>,
    replacements: VecDeque<NodeContact>,
    k: usize,
    last_updated: Instant,
}

pub enum AddOutcome {
    /// Already present (moved to tail) or room was available (appended).
    Added,
    /// Bucket full; queued onto the replacement cache instead.
    Queued,
}

impl KBucket {
    pub fn new(lo: NodeId, hi: NodeId, k: usize) -> Self {
        Self {
            lo,
            hi,
            main: VecDeque::with_capacity(k),
            replacements: VecDeque::with_capacity(k),
            k,
            last_updated: Instant::now(),
        }
    }

    pub fn has_in_range(&self, id: &NodeId) -> bool {
        *id >= self.lo && *id <= self.hi
    }

    pub fn len(&self) -> usize {
        self.main.len()
    }

    pub fn is_full(&self) -> bool {
        self.main.len() >= self.k
    }

    pub fn contacts(&self) -> impl Iterator<Item = &NodeContact> {
        self.main.iter()
    }

    pub fn head(&self) -> Option<NodeContact> {
        self.main.front().copied()
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn touch_last_updated(&mut self) {
        self.last_updated = Instant::now();
    }

    /// Add or refresh a node. Present entries move to the tail. A full
    /// bucket queues the offer on the (bounded, most-recently-offered-wins)
    /// replacement cache instead.
    pub fn add(&mut self, node: NodeContact) -> AddOutcome {
        if let Some(pos) = self.main.iter().position(|n| n.id == node.id) {
            self.main.remove(pos);
            self.main.push_back(node);
            self.touch_last_updated();
            return AddOutcome::Added;
        }
        if self.main.len() < self.k {
            self.main.push_back(node);
            self.touch_last_updated();
            return AddOutcome::Added;
        }
        if let Some(pos) = self.replacements.iter().position(|n| n.id == node.id) {
            self.replacements.remove(pos);
        }
        if self.replacements.len() >= self.k {
            self.replacements.pop_front();
        }
        self.replacements.push_back(node);
        AddOutcome::Queued
    }

    /// Remove a node by id. If a replacement is waiting, promote the
    /// most-recently-offered one into the freed slot.
    pub fn remove(&mut self, id: &NodeId) {
        self.main.retain(|n| n.id != *id);
        if let Some(replacement) = self.replacements.pop_back() {
            self.main.push_back(replacement);
        }
    }

    /// Longest bit-prefix shared across every entry's id.
    pub fn depth(&self) -> usize {
        if self.main.len() < 2 {
            return self.lo.shared_prefix_bits(&self.hi);
        }
        let mut ids: Vec<NodeId> = self.main.iter().map(|n| n.id).collect();
        ids.sort();
        ids.windows(2)
            .map(|w| w[0].shared_prefix_bits(&w[1]))
            .min()
            .unwrap_or(0)
    }

    /// Split at the midpoint of `[lo, hi]`; the midpoint itself belongs to
    /// the lower half. The replacement queue is discarded.
    pub fn split(self) -> (KBucket, KBucket) {
        let mid_bytes: [u8; ID_BYTES] =
            bigint::add(&self.lo.0, &bigint::shr1(&bigint::sub(&self.hi.0, &self.lo.0)));
        let mid = NodeId(mid_bytes);
        let upper_lo = NodeId(bigint::add_one(&mid.0));

        let mut lower = KBucket::new(self.lo, mid, self.k);
        let mut upper = KBucket::new(upper_lo, self.hi, self.k);

        for node in self.main {
            if node.id <= mid {
                lower.main.push_back(node);
            } else {
                upper.main.push_back(node);
            }
        }
        (lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> KBucket {
        KBucket::new(NodeId([0u8; 20]), NodeId([0xffu8; 20]), 4)
    }

    fn contact(byte: u8) -> NodeContact {
        NodeContact::new(NodeId([byte; 20]), ([127, 0, 0, 1], byte as u16 + 1000).into())
    }

    #[test]
    fn overflow_queues_to_replacement() {
        let mut b = bucket();
        for i in 0..4 {
            matches!(b.add(contact(i)), AddOutcome::Added);
        }
        matches!(b.add(contact(99)), AddOutcome::Queued);
        assert_eq!(b.len(), 4);
    }

    #[test]
    fn remove_promotes_newest_replacement() {
        let mut b = bucket();
        for i in 0..4 {
            b.add(contact(i));
        }
        b.add(contact(50));
        b.add(contact(60));
        b.remove(&contact(0).id);
        assert!(b.main.iter().any(|n| n.id == contact(60).id));
    }

    #[test]
    fn split_preserves_union_of_main_sets() {
        let mut b = bucket();
        let ids: Vec<NodeId> = (0..4).map(|i| contact(i).id).collect();
        for i in 0..4 {
            b.add(contact(i));
        }
        let (lower, upper) = b.split();
        let mut union: Vec<NodeId> = lower.contacts().chain(upper.contacts()).map(|n| n.id).collect();
        union.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(union, expected);
    }

    #[test]
    fn split_ranges_partition_without_gap() {
        let b = bucket();
        let (lower, upper) = b.split();
        assert_eq!(upper.lo, NodeId(bigint::add_one(&lower.hi.0)));
    }
}
