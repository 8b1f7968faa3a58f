//! Datagram framing.
//!
//! ```text
//! byte 0      : message kind (0x00 = request, 0x01 = response)
//! bytes 1..20 : 20-byte message id (random)
//! bytes 21..N : MessagePack-encoded body
//! ```

use crate::error::{DhtError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MSGID_BYTES: usize = 20;
pub const HEADER_BYTES: usize = 1 + MSGID_BYTES;
/// Datagrams shorter than this are dropped outright: the 21-byte header
/// plus at least one byte of MessagePack body.
pub const MIN_DATAGRAM_BYTES: usize = HEADER_BYTES + 1;

pub type MsgId = [u8; MSGID_BYTES];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Request = 0x00,
    Response = 0x01,
}

/// `[ method_name, args ]`, the request body's wire shape.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestBody {
    pub method: String,
    pub args: Vec<Value>,
}

pub fn random_msgid() -> MsgId {
    use rand::RngCore;
    let mut id = [0u8; MSGID_BYTES];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Frame a request datagram, rejecting it if it would exceed `limit` bytes.
pub fn frame_request(msgid: MsgId, method: &str, args: Vec<Value>, limit: usize) -> Result<Vec<u8>> {
    let body = RequestBody {
        method: method.to_string(),
        args,
    };
    frame(Kind::Request, msgid, &body, limit)
}

/// Frame a response datagram carrying an arbitrary MessagePack value.
pub fn frame_response(msgid: MsgId, body: &Value, limit: usize) -> Result<Vec<u8>> {
    frame(Kind::Response, msgid, body, limit)
}

fn frame<T: Serialize>(kind: Kind, msgid: MsgId, body: &T, limit: usize) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    encoded.push(kind as u8);
    encoded.extend_from_slice(&msgid);
    let payload = rmp_serde::to_vec_named(body).map_err(|e| DhtError::Encode(e.to_string()))?;
    encoded.extend_from_slice(&payload);
    if encoded.len() > limit {
        return Err(DhtError::OversizeRequest {
            limit,
            actual: encoded.len(),
        });
    }
    Ok(encoded)
}

pub struct Datagram {
    pub kind: Kind,
    pub msgid: MsgId,
    pub payload: Vec<u8>,
}

/// Parse the framing envelope. Datagrams shorter than `MIN_DATAGRAM_BYTES`
/// (22 bytes: header plus at least one body byte) are malformed.
pub fn parse_envelope(bytes: &[u8]) -> Result<Datagram> {
    if bytes.len() < MIN_DATAGRAM_BYTES {
        return Err(DhtError::MalformedDatagram(format!(
            "datagram of {} bytes shorter than the {}-byte minimum",
            bytes.len(),
            MIN_DATAGRAM_BYTES
        )));
    }
    let kind = match bytes[0] {
        0x00 => Kind::Request,
        0x01 => Kind::Response,
        other => return Err(DhtError::MalformedDatagram(format!("unknown message kind {other:#x}"))),
    };
    let mut msgid = [0u8; MSGID_BYTES];
    msgid.copy_from_slice(&bytes[1..HEADER_BYTES]);
    Ok(Datagram {
        kind,
        msgid,
        payload: bytes[HEADER_BYTES..].to_vec(),
    })
}

pub fn decode_request_body(payload: &[u8]) -> Result<RequestBody> {
    rmp_serde::from_slice(payload).map_err(|e| DhtError::MalformedDatagram(e.to_string()))
}

pub fn decode_response_body(payload: &[u8]) -> Result<Value> {
    rmp_serde::from_slice(payload).map_err(|e| DhtError::Decode(e.to_string()))
}
