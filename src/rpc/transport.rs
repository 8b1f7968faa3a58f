//! UDP datagram transport: framing, correlation, and timeouts.
//!
//! The one mutable shared map here is the pending-RPC table. Every call
//! registers its msgid *before* handing the datagram to the socket, closing
//! a race window against late registration: a response racing ahead of
//! registration would otherwise be dropped as unknown.

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::rpc::wire::{self, Kind, MsgId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handles an inbound request and produces the response body, or `None` to
/// drop it silently (unknown method).
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(&self, sender: SocketAddr, method: &str, args: Vec<Value>) -> Option<Value>;
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    config: DhtConfig,
    pending: Mutex<HashMap<MsgId, oneshot::Sender<Option<Value>>>>,
    dispatcher: RwLock<Option<Arc<dyn RequestDispatcher>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, config: DhtConfig) -> Result<Arc<Transport>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Transport {
            socket: Arc::new(socket),
            config,
            pending: Mutex::new(HashMap::new()),
            dispatcher: RwLock::new(None),
            recv_task: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn RequestDispatcher>) {
        *self.dispatcher.write().expect("dispatcher lock poisoned") = Some(dispatcher);
    }

    /// Spawn the receive loop. Each datagram is handled in its own task so a
    /// slow handler never blocks the next `recv_from`.
    pub fn spawn_recv_loop(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let (len, from) = match this.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("udp recv error: {e}");
                        continue;
                    }
                };
                let bytes = buf[..len].to_vec();
                let worker = this.clone();
                tokio::spawn(async move {
                    worker.handle_datagram(from, bytes).await;
                });
            }
        });
        *self.recv_task.lock().expect("recv task lock poisoned") = Some(handle);
    }

    async fn handle_datagram(&self, from: SocketAddr, bytes: Vec<u8>) {
        let envelope = match wire::parse_envelope(&bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!("dropping malformed datagram from {from}: {e}");
                return;
            }
        };
        match envelope.kind {
            Kind::Response => {
                let value = wire::decode_response_body(&envelope.payload).ok();
                let sender = self
                    .pending
                    .lock()
                    .expect("pending table lock poisoned")
                    .remove(&envelope.msgid);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(value);
                    }
                    None => debug!("response with unknown msgid from {from}, dropping"),
                }
            }
            Kind::Request => {
                let body = match wire::decode_request_body(&envelope.payload) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("malformed request body from {from}: {e}");
                        return;
                    }
                };
                let dispatcher = self.dispatcher.read().expect("dispatcher lock poisoned").clone();
                let Some(dispatcher) = dispatcher else {
                    warn!("no dispatcher registered, dropping request from {from}");
                    return;
                };
                debug!("dispatching {} from {from}", body.method);
                if let Some(response) = dispatcher.dispatch(from, &body.method, body.args).await {
                    match wire::frame_response(envelope.msgid, &response, self.config.request_size_limit) {
                        Ok(framed) => {
                            if let Err(e) = self.socket.send_to(&framed, from).await {
                                warn!("failed to send response to {from}: {e}");
                            }
                        }
                        Err(e) => warn!("failed to frame response to {from}: {e}"),
                    }
                }
            }
        }
    }

    /// Send a request and await its response or timeout.
    pub async fn call(&self, target: SocketAddr, method: &str, args: Vec<Value>) -> Result<Value> {
        let msgid = wire::random_msgid();
        let (tx, rx) = oneshot::channel();
        // Register before the datagram leaves the socket, so a fast response
        // can never race ahead of the table entry it needs to resolve.
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(msgid, tx);

        let framed = match wire::frame_request(msgid, method, args, self.config.request_size_limit) {
            Ok(f) => f,
            Err(e) => {
                self.pending.lock().expect("pending table lock poisoned").remove(&msgid);
                return Err(e);
            }
        };

        if let Err(e) = self.socket.send_to(&framed, target).await {
            self.pending.lock().expect("pending table lock poisoned").remove(&msgid);
            return Err(DhtError::Io(e));
        }

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(Some(value))) => Ok(value),
            Ok(Ok(None)) => Err(DhtError::Decode("empty response body".to_string())),
            Ok(Err(_canceled)) => Err(DhtError::Timeout(target)),
            Err(_elapsed) => {
                self.pending.lock().expect("pending table lock poisoned").remove(&msgid);
                Err(DhtError::Timeout(target))
            }
        }
    }

    /// Abort the receive loop and resolve every in-flight call as a timeout.
    pub async fn stop(&self) {
        if let Some(handle) = self.recv_task.lock().expect("recv task lock poisoned").take() {
            handle.abort();
        }
        self.pending.lock().expect("pending table lock poisoned").clear();
    }
}
