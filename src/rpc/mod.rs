//! RPC transport: wire framing plus the UDP request/response layer.

pub mod transport;
pub mod wire;

pub use transport::{RequestDispatcher, Transport};
