//! 160-bit identifiers and the XOR distance metric.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

pub const ID_BYTES: usize = 20;
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 160-bit node/key identifier, canonical form is 40 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_BYTES]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; ID_BYTES]);

    /// SHA-1 digest of arbitrary bytes.
    pub fn digest(bytes: &[u8]) -> NodeId {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let out = hasher.finalize();
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(&out);
        NodeId(id)
    }

    /// SHA-1 of cryptographically random bytes, for a fresh local identity.
    pub fn random() -> NodeId {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        NodeId::digest(&seed)
    }

    /// Uniformly random id within `[lo, hi]` inclusive (used by bucket
    /// refresh to pick a probe target in a lonely bucket's range).
    pub fn random_in_range(lo: &NodeId, hi: &NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut out);
        let mut candidate = NodeId(out);
        // Clamp into range bytewise: blend lo/hi/random so the result always
        // falls within [lo, hi] without biasing toward either endpoint.
        for i in 0..ID_BYTES {
            let span = hi.0[i].wrapping_sub(lo.0[i]);
            if span == 0 {
                candidate.0[i] = lo.0[i];
            } else {
                candidate.0[i] = lo.0[i] + (candidate.0[i] % span.saturating_add(1).max(1));
            }
        }
        if candidate < *lo {
            candidate = *lo;
        }
        if candidate > *hi {
            candidate = *hi;
        }
        candidate
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<NodeId> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != ID_BYTES {
            return None;
        }
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(&bytes);
        Some(NodeId(id))
    }

    /// XOR distance to another id, as a big-endian unsigned 160-bit value.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Number of leading bits shared between `self` and `other`.
    pub fn shared_prefix_bits(&self, other: &NodeId) -> usize {
        let mut count = 0;
        for i in 0..ID_BYTES {
            let x = self.0[i] ^ other.0[i];
            if x == 0 {
                count += 8;
                continue;
            }
            count += x.leading_zeros() as usize;
            break;
        }
        count
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// XOR distance between two ids, compared as an unsigned big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Distance(pub [u8; ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);
}
