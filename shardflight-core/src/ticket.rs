//! Stream tickets
//!
//! A ticket is the single-use capability a consumer presents to fetch one
//! registered stream. It names the stream (`ticket_id`) and the node that
//! hosts it (`node_id`), so any node can tell whether to serve it locally or
//! relay it from its owner.
//!
//! Wire form: URL-safe base64 (no padding) over
//! `u16be len | ticket_id | u16be len | node_id`.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StreamError, StreamResult};

/// Upper bound for either identifier component.
pub const MAX_ID_LEN: usize = 1024;

/// Separator between ticket bytes and a correlation payload.
const PAYLOAD_SEPARATOR: u8 = b'.';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTicket {
    ticket_id: String,
    node_id: String,
}

impl StreamTicket {
    pub fn new(ticket_id: impl Into<String>, node_id: impl Into<String>) -> StreamResult<Self> {
        let ticket_id = ticket_id.into();
        let node_id = node_id.into();
        validate_component("ticket id", &ticket_id)?;
        validate_component("node id", &node_id)?;
        Ok(Self { ticket_id, node_id })
    }

    #[must_use]
    pub fn ticket_id(&self) -> &str {
        &self.ticket_id
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Encode to the opaque wire form handed to consumers.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut raw = BytesMut::with_capacity(4 + self.ticket_id.len() + self.node_id.len());
        // Lengths are bounded by MAX_ID_LEN at construction.
        raw.put_u16(self.ticket_id.len() as u16);
        raw.put_slice(self.ticket_id.as_bytes());
        raw.put_u16(self.node_id.len() as u16);
        raw.put_slice(self.node_id.as_bytes());
        Bytes::from(URL_SAFE_NO_PAD.encode(&raw))
    }

    /// Decode the wire form. Any structural problem is `InvalidTicket`.
    pub fn from_bytes(bytes: &[u8]) -> StreamResult<Self> {
        if bytes.is_empty() {
            return Err(StreamError::InvalidTicket("empty ticket".to_string()));
        }
        let raw = URL_SAFE_NO_PAD
            .decode(bytes)
            .map_err(|e| StreamError::InvalidTicket(format!("not base64: {e}")))?;
        let mut buf = raw.as_slice();
        let ticket_id = read_component(&mut buf, "ticket id")?;
        let node_id = read_component(&mut buf, "node id")?;
        if buf.has_remaining() {
            return Err(StreamError::InvalidTicket(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }
        Self::new(ticket_id, node_id)
    }
}

impl fmt::Display for StreamTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticket_id, self.node_id)
    }
}

fn validate_component(what: &str, value: &str) -> StreamResult<()> {
    if value.is_empty() {
        return Err(StreamError::InvalidTicket(format!("{what} is empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(StreamError::InvalidTicket(format!(
            "{what} longer than {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

fn read_component(buf: &mut &[u8], what: &str) -> StreamResult<String> {
    if buf.remaining() < 2 {
        return Err(StreamError::InvalidTicket(format!("truncated {what} length")));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(StreamError::InvalidTicket(format!("truncated {what}")));
    }
    let value = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| StreamError::InvalidTicket(format!("{what} is not utf-8")))?;
    buf.advance(len);
    Ok(value)
}

/// A ticket followed by an opaque correlation payload (e.g. a shard target)
/// owned by the layer above the streaming core.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedTicket<T> {
    pub ticket: StreamTicket,
    pub payload: T,
}

impl<T: Serialize + DeserializeOwned> CorrelatedTicket<T> {
    #[must_use]
    pub const fn new(ticket: StreamTicket, payload: T) -> Self {
        Self { ticket, payload }
    }

    pub fn to_bytes(&self) -> StreamResult<Bytes> {
        let payload = serde_json::to_vec(&self.payload)
            .map_err(|e| StreamError::Internal(format!("failed to encode payload: {e}")))?;
        let ticket = self.ticket.to_bytes();
        let encoded = URL_SAFE_NO_PAD.encode(payload);
        let mut out = BytesMut::with_capacity(ticket.len() + 1 + encoded.len());
        out.put_slice(&ticket);
        out.put_u8(PAYLOAD_SEPARATOR);
        out.put_slice(encoded.as_bytes());
        Ok(out.freeze())
    }

    pub fn from_bytes(bytes: &[u8]) -> StreamResult<Self> {
        let split = bytes
            .iter()
            .position(|b| *b == PAYLOAD_SEPARATOR)
            .ok_or_else(|| StreamError::InvalidTicket("missing correlation payload".to_string()))?;
        let ticket = StreamTicket::from_bytes(&bytes[..split])?;
        let raw = URL_SAFE_NO_PAD
            .decode(&bytes[split + 1..])
            .map_err(|e| StreamError::InvalidTicket(format!("payload not base64: {e}")))?;
        let payload = serde_json::from_slice(&raw)
            .map_err(|e| StreamError::InvalidTicket(format!("payload not decodable: {e}")))?;
        Ok(Self { ticket, payload })
    }
}
