//! Centralized error type for the DHT core.
//!
//! Every fallible operation returns `Result<T>`. RPC-layer failures are
//! always local: a timeout or a malformed datagram never produces an error
//! response on the wire, it only ever shows up here to the caller that
//! initiated the operation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("datagram malformed: {0}")]
    MalformedDatagram(String),

    #[error("request exceeds {limit} byte limit after framing ({actual} bytes)")]
    OversizeRequest { limit: usize, actual: usize },

    #[error("rpc to {0} timed out")]
    Timeout(std::net::SocketAddr),

    #[error("no handler registered for method {0:?}")]
    UnknownMethod(String),

    #[error("value must be a byte sequence")]
    InvalidValue,

    #[error("routing table has no known neighbors")]
    NoKnownNeighbors,

    #[error("socket is not bound; call listen() first")]
    NotListening,

    #[error("server is already listening")]
    AlreadyListening,
}
