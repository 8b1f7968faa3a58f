//! The iterative α-parallel lookup ("spider crawl") for both nodes and
//! values.

use crate::identity::NodeId;
use crate::node::NodeContact;
use crate::protocol::{FindValueOutcome, Protocol};
use crate::routing::NodeHeap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CrawlMode {
    Node,
    Value,
}

pub enum CrawlOutcome {
    Nodes(Vec<NodeContact>),
    Value(Vec<u8>),
    NotFound,
}

enum QueryOutcome {
    Nodes(Vec<NodeContact>),
    Value(Vec<u8>),
}

/// One spider instance performs one lookup. Rounds are strictly serialized:
/// round n+1 never starts before every RPC of round n resolves.
pub struct Spider {
    protocol: Arc<Protocol>,
    gateways: Arc<Mutex<Vec<SocketAddr>>>,
}

impl Spider {
    pub fn new(protocol: Arc<Protocol>, gateways: Arc<Mutex<Vec<SocketAddr>>>) -> Self {
        Self { protocol, gateways }
    }

    pub async fn crawl(&self, target: NodeId, mode: CrawlMode, seeds: Vec<NodeContact>) -> CrawlOutcome {
        let config = self.protocol.config();
        let mut heap = NodeHeap::new(target, config.k);
        heap.extend(seeds);
        let mut contacted: HashSet<NodeId> = HashSet::new();
        let mut last_ids_crawled: Option<String> = None;

        loop {
            let visible = heap.visible();
            if visible.is_empty() {
                return empty_outcome(mode);
            }
            let visible_ids = visible.iter().map(|n| n.id.to_hex()).collect::<Vec<_>>().join(",");

            let mut uncontacted: Vec<NodeContact> =
                visible.iter().filter(|n| !contacted.contains(&n.id)).copied().collect();
            if uncontacted.is_empty() {
                return match mode {
                    CrawlMode::Node => CrawlOutcome::Nodes(visible),
                    CrawlMode::Value => CrawlOutcome::NotFound,
                };
            }

            // Fast-forward: once the visible frontier stops changing between
            // rounds, widen to the whole uncontacted set instead of staying
            // at alpha.
            let take = if last_ids_crawled.as_deref() == Some(visible_ids.as_str()) {
                uncontacted.len()
            } else {
                config.alpha.min(uncontacted.len())
            };
            last_ids_crawled = Some(visible_ids);
            let batch: Vec<NodeContact> = uncontacted.drain(..take.max(1)).collect();

            self.stun_prime(&batch).await;
            for peer in &batch {
                contacted.insert(peer.id);
            }

            let mut in_flight = JoinSet::new();
            for peer in batch.iter().copied() {
                let protocol = self.protocol.clone();
                in_flight.spawn(async move {
                    let outcome = match mode {
                        CrawlMode::Node => protocol.call_find_node(peer, &target).await.map(QueryOutcome::Nodes),
                        CrawlMode::Value => protocol.call_find_value(peer, &target).await.map(|v| match v {
                            FindValueOutcome::Value(bytes) => QueryOutcome::Value(bytes),
                            FindValueOutcome::Nodes(nodes) => QueryOutcome::Nodes(nodes),
                        }),
                    };
                    (peer, outcome)
                });
            }

            let mut found_values: Vec<Vec<u8>> = Vec::new();
            let mut nodes_reporters: Vec<NodeContact> = Vec::new();
            while let Some(joined) = in_flight.join_next().await {
                let (peer, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("spider query task panicked: {e}");
                        continue;
                    }
                };
                match outcome {
                    Ok(QueryOutcome::Nodes(nodes)) => {
                        heap.extend(nodes);
                        nodes_reporters.push(peer);
                        self.protocol.handle_call_response(true, peer).await;
                    }
                    Ok(QueryOutcome::Value(value)) => {
                        found_values.push(value);
                        self.protocol.handle_call_response(true, peer).await;
                    }
                    Err(_) => {
                        heap.remove(&peer.id);
                        self.protocol.handle_call_response(false, peer).await;
                    }
                }
            }

            match mode {
                CrawlMode::Node => {
                    let visible_now = heap.visible();
                    if visible_now.iter().all(|n| contacted.contains(&n.id)) {
                        return CrawlOutcome::Nodes(visible_now);
                    }
                }
                CrawlMode::Value => {
                    if !found_values.is_empty() {
                        let value = plurality(found_values);
                        if let Some(closest) = nodes_reporters.iter().min_by_key(|n| n.id.distance(&target)) {
                            let _ = self.protocol.call_store(*closest, &target, value.clone()).await;
                        }
                        return CrawlOutcome::Value(value);
                    }
                    let visible_now = heap.visible();
                    if visible_now.iter().all(|n| contacted.contains(&n.id)) {
                        return CrawlOutcome::NotFound;
                    }
                }
            }
        }
    }

    /// Warm NAT mappings on the gateways we bootstrapped through before
    /// querying `batch`. Best-effort, fire-and-forget.
    async fn stun_prime(&self, batch: &[NodeContact]) {
        let gateways = self.gateways.lock().expect("gateway list lock poisoned").clone();
        if gateways.is_empty() {
            return;
        }
        for gateway in gateways {
            let protocol = self.protocol.clone();
            let peers = batch.to_vec();
            tokio::spawn(async move {
                let _ = protocol.call_stun(gateway, &peers).await;
            });
        }
    }
}

fn empty_outcome(mode: CrawlMode) -> CrawlOutcome {
    match mode {
        CrawlMode::Node => CrawlOutcome::Nodes(Vec::new()),
        CrawlMode::Value => CrawlOutcome::NotFound,
    }
}

/// Multiple distinct values under one key are logged, not treated as an
/// error; the plurality wins. Not Byzantine-safe, preserved as-is.
fn plurality(values: Vec<Vec<u8>>) -> Vec<u8> {
    use std::collections::HashMap;
    let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
    for v in &values {
        *counts.entry(v.clone()).or_insert(0) += 1;
    }
    if counts.len() > 1 {
        warn!("{} distinct values returned for the same key; taking the plurality", counts.len());
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(value, _)| value)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::protocol::TransportPinger;
    use crate::routing::RoutingTable;
    use crate::rpc::Transport;
    use crate::storage::ValueStore;
    use std::time::Duration;

    async fn spin_up_node(config: DhtConfig) -> (Arc<Protocol>, NodeId, SocketAddr) {
        let id = NodeId::random();
        let transport = Transport::bind(([127, 0, 0, 1], 0).into(), config).await.unwrap();
        let pinger = TransportPinger::new(transport.clone(), id);
        let routing = Arc::new(RoutingTable::new(id, config.k, pinger.clone()));
        pinger.bind_routing(&routing);
        let protocol = Arc::new(Protocol::new(id, config, routing, Arc::new(ValueStore::new(config.value_ttl)), transport.clone()));
        transport.set_dispatcher(protocol.clone());
        transport.spawn_recv_loop();
        let addr = transport.local_addr().unwrap();
        (protocol, id, addr)
    }

    #[tokio::test]
    async fn node_mode_crawl_over_a_three_node_chain_discovers_the_far_end() {
        let config = DhtConfig {
            k: 20,
            alpha: 3,
            rpc_timeout: Duration::from_millis(300),
            ..DhtConfig::default()
        };
        let (n1, n1_id, n1_addr) = spin_up_node(config).await;
        let (n2, n2_id, n2_addr) = spin_up_node(config).await;
        let (n3, n3_id, n3_addr) = spin_up_node(config).await;
        let _ = (n1_id, n3_id);

        // n2 knows both n1 and n3; n1 initially knows only n2.
        n2.routing().add_contact(NodeContact::new(n1_id, n1_addr));
        n2.routing().add_contact(NodeContact::new(n3_id, n3_addr));
        n3.routing().add_contact(NodeContact::new(n2_id, n2_addr));
        n1.routing().add_contact(NodeContact::new(n2_id, n2_addr));

        let spider = Spider::new(n1.clone(), Arc::new(Mutex::new(Vec::new())));
        let seeds = vec![NodeContact::new(n2_id, n2_addr)];
        match spider.crawl(n3_id, CrawlMode::Node, seeds).await {
            CrawlOutcome::Nodes(nodes) => assert!(nodes.iter().any(|n| n.id == n3_id)),
            _ => panic!("expected a node list"),
        }
    }

    #[tokio::test]
    async fn value_mode_crawl_finds_a_value_stored_on_a_remote_peer() {
        let config = DhtConfig {
            k: 20,
            alpha: 3,
            rpc_timeout: Duration::from_millis(300),
            ..DhtConfig::default()
        };
        let (n1, n1_id, n1_addr) = spin_up_node(config).await;
        let (n2, n2_id, n2_addr) = spin_up_node(config).await;
        n1.routing().add_contact(NodeContact::new(n2_id, n2_addr));
        n2.routing().add_contact(NodeContact::new(n1_id, n1_addr));

        let key = NodeId::digest(b"bandwidth-report-A");
        n2.call_store(NodeContact::new(n2_id, n2_addr), &key, b"payload".to_vec())
            .await
            .unwrap();

        let spider = Spider::new(n1.clone(), Arc::new(Mutex::new(Vec::new())));
        let seeds = vec![NodeContact::new(n2_id, n2_addr)];
        match spider.crawl(key, CrawlMode::Value, seeds).await {
            CrawlOutcome::Value(v) => assert_eq!(v, b"payload".to_vec()),
            CrawlOutcome::NotFound => panic!("expected a value"),
            CrawlOutcome::Nodes(_) => panic!("expected a value, not a node list"),
        }
    }

    #[tokio::test]
    async fn node_mode_crawl_with_no_seeds_returns_empty() {
        let config = DhtConfig::default();
        let (n1, _id, _addr) = spin_up_node(config).await;
        let spider = Spider::new(n1, Arc::new(Mutex::new(Vec::new())));
        match spider.crawl(NodeId::random(), CrawlMode::Node, vec![]).await {
            CrawlOutcome::Nodes(nodes) => assert!(nodes.is_empty()),
            _ => panic!("expected an empty node list"),
        }
    }
}
