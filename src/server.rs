//! The server facade: bootstrap, get/set, periodic refresh and republish.

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::identity::NodeId;
use crate::node::NodeContact;
use crate::protocol::{Protocol, TransportPinger};
use crate::routing::RoutingTable;
use crate::rpc::Transport;
use crate::spider::{CrawlMode, CrawlOutcome, Spider};
use crate::storage::ValueStore;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Bound {
    transport: Arc<Transport>,
    routing: Arc<RoutingTable>,
    protocol: Arc<Protocol>,
    refresh_task: JoinHandle<()>,
}

/// A running (or not-yet-listening) DHT node.
///
/// Constructed with `new`, then `listen`ed on a socket; `bootstrap`, `get`,
/// and `set` all require a prior successful `listen`.
pub struct DhtServer {
    local_id: NodeId,
    config: DhtConfig,
    storage: Arc<ValueStore>,
    gateways: Arc<Mutex<Vec<SocketAddr>>>,
    bound: OnceLock<Bound>,
}

impl DhtServer {
    /// `k` and `alpha` (and the rest of the knobs) come from `config`;
    /// defaults are k=20, α=3. `node_id` defaults to SHA-1 of random bytes;
    /// `storage` defaults to a fresh TTL-bounded store.
    pub fn new(config: DhtConfig, node_id: Option<NodeId>, storage: Option<Arc<ValueStore>>) -> Arc<Self> {
        let local_id = node_id.unwrap_or_else(NodeId::random);
        let storage = storage.unwrap_or_else(|| Arc::new(ValueStore::new(config.value_ttl)));
        Arc::new(Self {
            local_id,
            config,
            storage,
            gateways: Arc::new(Mutex::new(Vec::new())),
            bound: OnceLock::new(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Bind the UDP socket, wire the protocol dispatcher, and start the
    /// periodic refresh/republish task.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        if self.bound.get().is_some() {
            return Err(DhtError::AlreadyListening);
        }

        let transport = Transport::bind(addr, self.config).await?;
        let pinger = TransportPinger::new(transport.clone(), self.local_id);
        let routing = Arc::new(RoutingTable::new(self.local_id, self.config.k, pinger.clone()));
        pinger.bind_routing(&routing);
        let protocol = Arc::new(Protocol::new(
            self.local_id,
            self.config,
            routing.clone(),
            self.storage.clone(),
            transport.clone(),
        ));
        transport.set_dispatcher(protocol.clone());
        transport.spawn_recv_loop();
        let local_addr = transport.local_addr()?;
        info!("listening on {local_addr} as {}", self.local_id);

        let refresh_task = self.clone().spawn_refresh_task();
        self.bound
            .set(Bound { transport, routing, protocol, refresh_task })
            .map_err(|_| DhtError::AlreadyListening)?;
        Ok(local_addr)
    }

    /// Ping each address to learn its id, then run a node-mode crawl for our
    /// own id seeded with whatever answered, filling the routing table.
    /// A single live bootstrap address suffices; the rest are tolerated
    /// failures.
    pub async fn bootstrap(self: &Arc<Self>, addresses: Vec<SocketAddr>) -> Result<Vec<NodeContact>> {
        let bound = self.bound.get().ok_or(DhtError::NotListening)?;

        self.gateways
            .lock()
            .expect("gateway list lock poisoned")
            .extend(addresses.iter().copied());

        let mut live = Vec::new();
        for addr in &addresses {
            match bound.protocol.call_ping(*addr).await {
                Ok(id) => {
                    let contact = NodeContact::new(id, *addr);
                    bound.routing.add_contact(contact);
                    live.push(contact);
                }
                Err(e) => warn!("bootstrap peer {addr} unreachable: {e}"),
            }
        }
        if live.is_empty() {
            return Ok(live);
        }

        let spider = Spider::new(bound.protocol.clone(), self.gateway_list());
        let _ = spider.crawl(self.local_id, CrawlMode::Node, live.clone()).await;
        Ok(live)
    }

    /// Local hit short-circuits; otherwise a value-mode crawl.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<Option<Vec<u8>>> {
        let bound = self.bound.get().ok_or(DhtError::NotListening)?;
        let digest = NodeId::digest(key.as_bytes());
        if let Some(value) = self.storage.get(&digest) {
            return Ok(Some(value));
        }
        let seeds = bound.routing.find_neighbors(&digest, Some(self.config.k), None);
        if seeds.is_empty() {
            return Ok(None);
        }
        let spider = Spider::new(bound.protocol.clone(), self.gateway_list());
        match spider.crawl(digest, CrawlMode::Value, seeds).await {
            CrawlOutcome::Value(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// `value` is opaque bytes; digests `key`, finds node candidates, and
    /// stores on each. Also stores locally iff the local id is closer to the
    /// key than at least one returned candidate, i.e. not the furthest of
    /// the set. Returns true iff at least one remote store succeeded.
    pub async fn set(self: &Arc<Self>, key: &str, value: Vec<u8>) -> Result<bool> {
        self.set_digest(NodeId::digest(key.as_bytes()), value).await
    }

    async fn set_digest(self: &Arc<Self>, digest: NodeId, value: Vec<u8>) -> Result<bool> {
        let bound = self.bound.get().ok_or(DhtError::NotListening)?;
        let seeds = bound.routing.find_neighbors(&digest, Some(self.config.k), None);
        if seeds.is_empty() {
            return Ok(false);
        }

        let spider = Spider::new(bound.protocol.clone(), self.gateway_list());
        let candidates = match spider.crawl(digest, CrawlMode::Node, seeds).await {
            CrawlOutcome::Nodes(nodes) => nodes,
            _ => Vec::new(),
        };
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut any_success = false;
        let mut last_error: Option<DhtError> = None;
        for candidate in &candidates {
            match bound.protocol.call_store(*candidate, &digest, value.clone()).await {
                Ok(()) => any_success = true,
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(e) = last_error.filter(|_| !any_success) {
            debug!("set_digest: every remote store failed, last error: {e}");
        }

        if let Some(furthest) = candidates.iter().map(|c| c.id.distance(&digest)).max() {
            if self.local_id.distance(&digest) < furthest {
                self.storage.set(digest, value);
            }
        }

        Ok(any_success)
    }

    /// Close the socket and cancel the refresh timer.
    pub async fn stop(&self) {
        if let Some(bound) = self.bound.get() {
            bound.refresh_task.abort();
            bound.transport.stop().await;
        }
    }

    fn gateway_list(&self) -> Arc<Mutex<Vec<SocketAddr>>> {
        self.gateways.clone()
    }

    fn spawn_refresh_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.refresh_period);
            loop {
                ticker.tick().await;
                self.refresh_once().await;
            }
        })
    }

    /// For every lonely bucket, crawl a random id in its range; then
    /// republish every value older than an hour.
    async fn refresh_once(self: &Arc<Self>) {
        let Some(bound) = self.bound.get() else { return };

        for hex in bound.protocol.refresh_ids() {
            let Some(id) = NodeId::from_hex(&hex) else { continue };
            let seeds = bound.routing.find_neighbors(&id, Some(self.config.k), None);
            if seeds.is_empty() {
                continue;
            }
            let spider = Spider::new(bound.protocol.clone(), self.gateway_list());
            let _ = spider.crawl(id, CrawlMode::Node, seeds).await;
        }

        for (digest, value) in self.storage.items_older_than(Duration::from_secs(3600)) {
            if let Err(e) = self.set_digest(digest, value).await {
                warn!("republish failed for {digest}: {e}");
            }
        }
    }
}
