//! Kademlia RPC semantics over transport, routing table, and storage.
//!
//! Dispatch is an explicit `method name -> handler` table built once at
//! construction rather than dynamic string-prefix dispatch. Each handler is
//! a plain function pointer that boxes its own async call, since distinct
//! `async fn`s produce distinct anonymous future types and cannot otherwise
//! share one fn-pointer slot.

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::identity::NodeId;
use crate::node::NodeContact;
use crate::routing::{Pinger, RoutingTable};
use crate::rpc::{RequestDispatcher, Transport};
use crate::storage::ValueStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use tracing::warn;

/// Pings a stale bucket head through the RPC transport and evicts it from
/// the routing table if it doesn't answer in time. Built independently of
/// `Protocol` (which owns both the transport and the table) to avoid a
/// cyclic reference between routing and protocol: the table gets this
/// narrow capability injected at construction, and the table reference it
/// needs to evict into is bound in after the fact via a weak handle, once
/// the `Arc<RoutingTable>` exists.
pub struct TransportPinger {
    transport: Arc<Transport>,
    local_id: NodeId,
    routing: OnceLock<Weak<RoutingTable>>,
}

impl TransportPinger {
    pub fn new(transport: Arc<Transport>, local_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            transport,
            local_id,
            routing: OnceLock::new(),
        })
    }

    /// Complete the wiring once the routing table it will evict from exists.
    pub fn bind_routing(&self, routing: &Arc<RoutingTable>) {
        let _ = self.routing.set(Arc::downgrade(routing));
    }
}

impl Pinger for TransportPinger {
    fn ping_and_evict_on_timeout(&self, node: NodeContact) {
        let transport = self.transport.clone();
        let local_id = self.local_id;
        let routing = self.routing.get().cloned();
        tokio::spawn(async move {
            let reachable = transport
                .call(node.addr, "ping", vec![json!(local_id.to_hex())])
                .await
                .is_ok();
            if !reachable {
                if let Some(rt) = routing.and_then(|w| w.upgrade()) {
                    rt.remove_contact(&node.id);
                }
            }
        });
    }
}

/// The outcome of a `find_value` call: either the value itself, or the node
/// list a `find_node` would have returned.
pub enum FindValueOutcome {
    Value(Vec<u8>),
    Nodes(Vec<NodeContact>),
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type HandlerFn = for<'a> fn(&'a Protocol, SocketAddr, Vec<Value>) -> BoxFuture<'a, Result<Value>>;

pub struct Protocol {
    local_id: NodeId,
    config: DhtConfig,
    routing: Arc<RoutingTable>,
    storage: Arc<ValueStore>,
    transport: Arc<Transport>,
    handlers: HashMap<&'static str, HandlerFn>,
}

impl Protocol {
    pub fn new(
        local_id: NodeId,
        config: DhtConfig,
        routing: Arc<RoutingTable>,
        storage: Arc<ValueStore>,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            local_id,
            config,
            routing,
            storage,
            transport,
            handlers: handler_table(),
        }
    }

    pub fn config(&self) -> DhtConfig {
        self.config
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Every lonely bucket's randomly-chosen refresh target, as canonical
    /// hex.
    pub fn refresh_ids(&self) -> Vec<String> {
        self.routing
            .lonely_buckets()
            .into_iter()
            .map(|(lo, hi)| NodeId::random_in_range(&lo, &hi).to_hex())
            .collect()
    }

    /// A newly-seen contact may need a forwarded copy of anything we store
    /// that it is now closer to than our current k neighbors.
    pub(crate) async fn welcome_if_new(&self, contact: NodeContact) {
        if !self.routing.contains(&contact.id) {
            for (keynode, value) in self.storage.items() {
                let neighbors = self.routing.find_neighbors(&keynode, Some(self.config.k), None);
                let should_forward = match (neighbors.first(), neighbors.last()) {
                    (Some(closest), Some(furthest)) => {
                        let new_dist = contact.id.distance(&keynode);
                        let furthest_dist = furthest.id.distance(&keynode);
                        let local_dist = self.local_id.distance(&keynode);
                        let closest_dist = closest.id.distance(&keynode);
                        new_dist < furthest_dist && local_dist < closest_dist
                    }
                    _ => true,
                };
                if should_forward {
                    let transport = self.transport.clone();
                    let local_id = self.local_id;
                    tokio::spawn(async move {
                        let _ = transport
                            .call(
                                contact.addr,
                                "store",
                                vec![json!(local_id.to_hex()), json!(keynode.to_hex()), bytes_to_value(&value)],
                            )
                            .await;
                    });
                }
            }
        }
        self.routing.add_contact(contact);
    }

    /// Success welcomes the peer; silence (timeout) evicts it. Called by the
    /// spider after every RPC it issues.
    pub(crate) async fn handle_call_response(&self, success: bool, node: NodeContact) {
        if success {
            self.welcome_if_new(node).await;
        } else {
            self.routing.remove_contact(&node.id);
        }
    }

    // --- client-side call wrappers, used by bootstrap and the spider ---

    pub async fn call_ping(&self, target: SocketAddr) -> Result<NodeId> {
        let resp = self.transport.call(target, "ping", vec![json!(self.local_id.to_hex())]).await?;
        let hex = resp.as_str().ok_or_else(|| DhtError::Decode("ping response not a string".into()))?;
        NodeId::from_hex(hex).ok_or_else(|| DhtError::Decode("ping response not a valid id".into()))
    }

    pub async fn call_find_node(&self, target: NodeContact, id: &NodeId) -> Result<Vec<NodeContact>> {
        let resp = self
            .transport
            .call(target.addr, "find_node", vec![json!(self.local_id.to_hex()), json!(id.to_hex())])
            .await?;
        parse_node_list(&resp)
    }

    pub async fn call_find_value(&self, target: NodeContact, key: &NodeId) -> Result<FindValueOutcome> {
        let resp = self
            .transport
            .call(target.addr, "find_value", vec![json!(self.local_id.to_hex()), json!(key.to_hex())])
            .await?;
        if let Some(value) = resp.get("value") {
            return Ok(FindValueOutcome::Value(value_to_bytes(value)?));
        }
        Ok(FindValueOutcome::Nodes(parse_node_list(&resp)?))
    }

    pub async fn call_store(&self, target: NodeContact, key: &NodeId, value: Vec<u8>) -> Result<()> {
        self.transport
            .call(
                target.addr,
                "store",
                vec![json!(self.local_id.to_hex()), json!(key.to_hex()), bytes_to_value(&value)],
            )
            .await?;
        Ok(())
    }

    pub async fn call_stun(&self, gateway: SocketAddr, peers: &[NodeContact]) -> Result<()> {
        self.transport.call(gateway, "stun", vec![encode_node_list(peers)]).await?;
        Ok(())
    }

    // --- request handlers, registered in `handler_table` below ---

    async fn rpc_ping(&self, sender: SocketAddr, args: Vec<Value>) -> Result<Value> {
        let src_id = parse_id_arg(&args, 0)?;
        self.welcome_if_new(NodeContact::new(src_id, sender)).await;
        Ok(json!(self.local_id.to_hex()))
    }

    async fn rpc_store(&self, sender: SocketAddr, args: Vec<Value>) -> Result<Value> {
        let src_id = parse_id_arg(&args, 0)?;
        let key = parse_id_arg(&args, 1)?;
        let value = value_to_bytes(
            args.get(2)
                .ok_or_else(|| DhtError::MalformedDatagram("store: missing value argument".into()))?,
        )?;
        self.welcome_if_new(NodeContact::new(src_id, sender)).await;
        self.storage.set(key, value);
        Ok(json!(true))
    }

    async fn rpc_find_node(&self, sender: SocketAddr, args: Vec<Value>) -> Result<Value> {
        let src_id = parse_id_arg(&args, 0)?;
        let target = parse_id_arg(&args, 1)?;
        let contact = NodeContact::new(src_id, sender);
        self.welcome_if_new(contact).await;
        let neighbors = self.routing.find_neighbors(&target, Some(self.config.k), Some(&contact));
        Ok(encode_node_list(&neighbors))
    }

    async fn rpc_find_value(&self, sender: SocketAddr, args: Vec<Value>) -> Result<Value> {
        let src_id = parse_id_arg(&args, 0)?;
        let key = parse_id_arg(&args, 1)?;
        let contact = NodeContact::new(src_id, sender);
        self.welcome_if_new(contact).await;
        if let Some(value) = self.storage.get(&key) {
            return Ok(json!({ "value": bytes_to_value(&value) }));
        }
        let neighbors = self.routing.find_neighbors(&key, Some(self.config.k), Some(&contact));
        Ok(encode_node_list(&neighbors))
    }

    /// NAT-traversal helper: asks each listed peer to `punch` toward
    /// `sender`, priming their mappings before the caller's lookup round
    /// reaches them. Best-effort; failures are not reported.
    async fn rpc_stun(&self, sender: SocketAddr, args: Vec<Value>) -> Result<Value> {
        let peers = parse_node_list(args.first().unwrap_or(&Value::Null)).unwrap_or_default();
        let sender_repr = json!([sender.ip().to_string(), sender.port()]);
        for peer in peers {
            let transport = self.transport.clone();
            let payload = sender_repr.clone();
            tokio::spawn(async move {
                let _ = transport.call(peer.addr, "punch", vec![payload]).await;
            });
        }
        Ok(sender_repr)
    }

    async fn rpc_punch(&self, _sender: SocketAddr, args: Vec<Value>) -> Result<Value> {
        if let Some(addr) = parse_host_port_arg(args.first()) {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let _ = transport.call(addr, "hole", vec![]).await;
            });
        }
        Ok(json!("hole"))
    }

    async fn rpc_hole(&self, _sender: SocketAddr, _args: Vec<Value>) -> Result<Value> {
        Ok(json!(self.local_id.to_hex()))
    }
}

#[async_trait]
impl RequestDispatcher for Protocol {
    async fn dispatch(&self, sender: SocketAddr, method: &str, args: Vec<Value>) -> Option<Value> {
        let handler = self.handlers.get(method)?;
        match handler(self, sender, args).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("rpc_{method} from {sender} failed locally: {e}");
                None
            }
        }
    }
}

fn h_ping(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_ping(sender, args))
}
fn h_store(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_store(sender, args))
}
fn h_find_node(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_find_node(sender, args))
}
fn h_find_value(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_find_value(sender, args))
}
fn h_stun(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_stun(sender, args))
}
fn h_punch(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_punch(sender, args))
}
fn h_hole(p: &Protocol, sender: SocketAddr, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(p.rpc_hole(sender, args))
}

fn handler_table() -> HashMap<&'static str, HandlerFn> {
    let mut m: HashMap<&'static str, HandlerFn> = HashMap::with_capacity(7);
    m.insert("ping", h_ping as HandlerFn);
    m.insert("store", h_store as HandlerFn);
    m.insert("find_node", h_find_node as HandlerFn);
    m.insert("find_value", h_find_value as HandlerFn);
    m.insert("stun", h_stun as HandlerFn);
    m.insert("punch", h_punch as HandlerFn);
    m.insert("hole", h_hole as HandlerFn);
    m
}

fn parse_id_arg(args: &[Value], index: usize) -> Result<NodeId> {
    let hex = args
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| DhtError::MalformedDatagram(format!("missing/invalid id argument at position {index}")))?;
    NodeId::from_hex(hex).ok_or_else(|| DhtError::MalformedDatagram(format!("invalid id hex {hex:?}")))
}

fn parse_host_port_arg(arg: Option<&Value>) -> Option<SocketAddr> {
    let arr = arg?.as_array()?;
    let host = arr.first()?.as_str()?;
    let port = arr.get(1)?.as_u64()?;
    let ip: std::net::IpAddr = host.parse().ok()?;
    Some(SocketAddr::new(ip, port as u16))
}

fn bytes_to_value(bytes: &[u8]) -> Value {
    json!(bytes)
}

fn value_to_bytes(value: &Value) -> Result<Vec<u8>> {
    value
        .as_array()
        .ok_or_else(|| DhtError::MalformedDatagram("value must be a byte array".into()))?
        .iter()
        .map(|n| {
            n.as_u64()
                .filter(|n| *n <= u8::MAX as u64)
                .map(|n| n as u8)
                .ok_or_else(|| DhtError::MalformedDatagram("value byte out of range".into()))
        })
        .collect()
}

fn encode_node_list(nodes: &[NodeContact]) -> Value {
    json!(nodes
        .iter()
        .map(|n| json!([n.id.to_hex(), n.addr.ip().to_string(), n.addr.port()]))
        .collect::<Vec<_>>())
}

fn parse_node_list(value: &Value) -> Result<Vec<NodeContact>> {
    let arr = match value.as_array() {
        Some(a) => a,
        None => return Ok(Vec::new()),
    };
    arr.iter()
        .map(|entry| {
            let entry = entry
                .as_array()
                .ok_or_else(|| DhtError::MalformedDatagram("node entry must be an array".into()))?;
            let id_hex = entry
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| DhtError::MalformedDatagram("node entry missing id".into()))?;
            let id = NodeId::from_hex(id_hex).ok_or_else(|| DhtError::MalformedDatagram("node entry bad id hex".into()))?;
            let host = entry
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| DhtError::MalformedDatagram("node entry missing host".into()))?;
            let port = entry
                .get(2)
                .and_then(Value::as_u64)
                .ok_or_else(|| DhtError::MalformedDatagram("node entry missing port".into()))?;
            let ip: std::net::IpAddr = host
                .parse()
                .map_err(|_| DhtError::MalformedDatagram(format!("node entry bad host {host:?}")))?;
            Ok(NodeContact::new(id, SocketAddr::new(ip, port as u16)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::storage::ValueStore;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    async fn protocol_pair() -> (Arc<Protocol>, Arc<Protocol>, SocketAddr, SocketAddr) {
        let config = DhtConfig {
            k: 4,
            alpha: 2,
            rpc_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };

        let a_id = NodeId::digest(b"node-a");
        let a_transport = Transport::bind(addr(0), config).await.unwrap();
        let a_pinger = TransportPinger::new(a_transport.clone(), a_id);
        let a_routing = Arc::new(RoutingTable::new(a_id, config.k, a_pinger.clone()));
        a_pinger.bind_routing(&a_routing);
        let a_protocol = Arc::new(Protocol::new(
            a_id,
            config,
            a_routing,
            Arc::new(ValueStore::new(config.value_ttl)),
            a_transport.clone(),
        ));
        a_transport.set_dispatcher(a_protocol.clone());
        a_transport.spawn_recv_loop();

        let b_id = NodeId::digest(b"node-b");
        let b_transport = Transport::bind(addr(0), config).await.unwrap();
        let b_pinger = TransportPinger::new(b_transport.clone(), b_id);
        let b_routing = Arc::new(RoutingTable::new(b_id, config.k, b_pinger.clone()));
        b_pinger.bind_routing(&b_routing);
        let b_protocol = Arc::new(Protocol::new(
            b_id,
            config,
            b_routing,
            Arc::new(ValueStore::new(config.value_ttl)),
            b_transport.clone(),
        ));
        b_transport.set_dispatcher(b_protocol.clone());
        b_transport.spawn_recv_loop();

        let a_addr = a_transport.local_addr().unwrap();
        let b_addr = b_transport.local_addr().unwrap();
        (a_protocol, b_protocol, a_addr, b_addr)
    }

    #[tokio::test]
    async fn ping_learns_the_remote_id_and_welcomes_it() {
        let (a, b, _a_addr, b_addr) = protocol_pair().await;
        let remote_id = a.call_ping(b_addr).await.unwrap();
        assert_eq!(remote_id, b.local_id);
        assert!(a.routing.contains(&b.local_id));
    }

    #[tokio::test]
    async fn store_then_find_value_roundtrips() {
        let (a, b, a_addr, b_addr) = protocol_pair().await;
        let b_contact = NodeContact::new(b.local_id, b_addr);
        let a_contact = NodeContact::new(a.local_id, a_addr);
        a.routing.add_contact(b_contact);
        b.routing.add_contact(a_contact);

        let key = NodeId::digest(b"bandwidth-report-A");
        a.call_store(b_contact, &key, b"thirty-two-bytes-of-payload-data".to_vec())
            .await
            .unwrap();

        match a.call_find_value(b_contact, &key).await.unwrap() {
            FindValueOutcome::Value(v) => assert_eq!(v, b"thirty-two-bytes-of-payload-data".to_vec()),
            FindValueOutcome::Nodes(_) => panic!("expected a value, got a node list"),
        }
    }

    #[tokio::test]
    async fn find_node_excludes_the_requesting_contact() {
        let (a, b, a_addr, b_addr) = protocol_pair().await;
        let a_contact = NodeContact::new(a.local_id, a_addr);
        b.routing.add_contact(a_contact);

        let neighbors = a.call_find_node(NodeContact::new(b.local_id, b_addr), &a.local_id).await.unwrap();
        assert!(neighbors.iter().all(|n| !n.same_home(&a_contact)));
    }

    #[tokio::test]
    async fn unknown_peer_times_out_and_is_never_welcomed() {
        let (a, _b, _a_addr, _b_addr) = protocol_pair().await;
        let dead = addr(1); // nothing bound here
        let result = a.call_ping(dead).await;
        assert!(result.is_err());
    }

    /// A routing-table member that silently stops answering is dropped the
    /// next time an RPC directed at it fails.
    #[tokio::test]
    async fn dead_contact_is_evicted_after_its_next_rpc_fails() {
        let (a, b, _a_addr, b_addr) = protocol_pair().await;
        let b_contact = NodeContact::new(b.local_id, b_addr);
        a.routing.add_contact(b_contact);
        assert!(a.routing.contains(&b.local_id));

        b.transport.stop().await; // b goes silent without telling anyone

        let result = a.call_ping(b_addr).await;
        assert!(result.is_err());
        a.handle_call_response(false, b_contact).await;

        assert!(!a.routing.contains(&b.local_id));
    }
}
