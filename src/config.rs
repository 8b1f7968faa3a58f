//! Runtime configuration knobs.
//!
//! Every tunable the DHT exposes lives here with its documented default, so
//! a caller can override one without having to thread the rest through by
//! hand.

use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct DhtConfig {
    /// Bucket replication width.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// RPC round-trip timeout.
    pub rpc_timeout: Duration,
    /// Maximum framed request size in bytes.
    pub request_size_limit: usize,
    /// Value-store entry lifetime before culling.
    pub value_ttl: Duration,
    /// Interval between lonely-bucket refresh / republish sweeps.
    pub refresh_period: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            rpc_timeout: Duration::from_secs(5),
            request_size_limit: 512,
            value_ttl: Duration::from_secs(20),
            refresh_period: Duration::from_secs(3600),
        }
    }
}
