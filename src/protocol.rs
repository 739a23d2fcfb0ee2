//! DHT protocol message definitions.
//!
//! Each message travels as one JSON object in one UDP datagram. The
//! `messageType` field selects the variant; every message also carries the
//! sender's [`Contact`] and an `rpcId` that a reply echoes back.
//!
//! ```json
//! {"messageType":"FIND_NODE","target":"ffffffff00…","from":{"id":"…","address":"10.0.0.2:4000"},"rpcId":7}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};
use crate::id::{Key, NodeId};
use crate::routing::Contact;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// The kind-specific part of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Liveness check.
    Ping,
    /// Answer to [`MessageKind::Ping`].
    Pong,
    /// Ask for the contacts closest to `target`.
    FindNode { target: NodeId },
    /// Ask for the value at `key`, or the contacts closest to it.
    FindData { key: Key },
    /// Ask the receiver to hold `value` under `key`.
    Store { key: Key, value: String },
    /// Answer to [`MessageKind::Store`].
    StoreResponse {
        #[serde(rename = "storeSuccess")]
        store_success: bool,
    },
    /// Answer to [`MessageKind::FindNode`].
    FoundContacts { contacts: Vec<Contact> },
    /// Answer to [`MessageKind::FindData`]: the value if held, else contacts.
    FoundData {
        #[serde(default)]
        contacts: Vec<Contact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// The request was not understood.
    Error,
}

impl MessageKind {
    /// Wire name of the kind, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::FindNode { .. } => "FIND_NODE",
            MessageKind::FindData { .. } => "FIND_DATA",
            MessageKind::Store { .. } => "STORE",
            MessageKind::StoreResponse { .. } => "STORE_RESPONSE",
            MessageKind::FoundContacts { .. } => "FOUND_CONTACTS",
            MessageKind::FoundData { .. } => "FOUND_DATA",
            MessageKind::Error => "ERROR",
        }
    }

    /// Whether this kind is a request a peer is expected to answer.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageKind::Ping
                | MessageKind::FindNode { .. }
                | MessageKind::FindData { .. }
                | MessageKind::Store { .. }
        )
    }
}

/// A complete protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub kind: MessageKind,
    /// The sender's contact information.
    pub from: Contact,
    /// Correlates a reply with its request.
    #[serde(rename = "rpcId")]
    pub rpc_id: u64,
}

impl Message {
    /// Build a request with a fresh random rpc id.
    pub fn request(from: Contact, kind: MessageKind) -> Self {
        Self {
            kind,
            from,
            rpc_id: rand::random(),
        }
    }

    /// Build the reply to `self`, echoing its rpc id.
    pub fn reply(&self, from: Contact, kind: MessageKind) -> Self {
        Self {
            kind,
            from,
            rpc_id: self.rpc_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(DhtError::InvalidMessage(format!(
                "{} message of {} bytes exceeds datagram size",
                self.kind.name(),
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode a datagram. Trailing whitespace (a newline terminator) is allowed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| DhtError::InvalidMessage(err.to_string()))
    }
}

/// Best-effort extraction of the rpc id from a payload that failed to decode,
/// so the `ERROR` reply can still be correlated by the sender.
pub fn salvage_rpc_id(bytes: &[u8]) -> u64 {
    #[derive(Deserialize)]
    struct Header {
        #[serde(rename = "rpcId")]
        rpc_id: u64,
    }
    serde_json::from_slice::<Header>(bytes)
        .map(|h| h.rpc_id)
        .unwrap_or_default()
}
