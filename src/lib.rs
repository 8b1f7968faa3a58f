//! Decentralized, UDP-based Kademlia DHT: a flat 160-bit key space in which
//! every node owns an id, stores opaque values addressable by 160-bit key,
//! and locates peers whose ids are XOR-closest to an arbitrary target.
//!
//! Entry points: [`DhtServer`] (construct, `listen`, `bootstrap`, `get`,
//! `set`, `stop`), [`DhtConfig`] for the tunables, and [`NodeId`]/
//! [`NodeContact`] for identifiers and peer references. The lower modules
//! (`routing`, `rpc`, `protocol`, `spider`, `storage`) are public so a host
//! application can compose around them directly, but `DhtServer` is the
//! supported façade.

pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod spider;
pub mod storage;

pub use config::DhtConfig;
pub use error::{DhtError, Result};
pub use identity::{Distance, NodeId};
pub use node::NodeContact;
pub use server::DhtServer;
pub use storage::ValueStore;
