//! Network capability and its UDP implementation.
//!
//! [`DhtNetwork`] is the only way the DHT engine talks to other peers, so the
//! core logic runs unchanged over real sockets ([`UdpNetwork`]) or an in-memory
//! test double.
//!
//! # Transport
//!
//! Every request opens an ephemeral UDP socket connected to the peer, sends a
//! single datagram and waits for the datagram that echoes its `rpcId`. The
//! per-call timeout is the only cancellation point; there are no retries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, trace};

use crate::error::{DhtError, Result};
use crate::id::{Key, NodeId};
use crate::protocol::{Message, MessageKind, MAX_DATAGRAM_SIZE};
use crate::routing::Contact;

/// Answer to a FIND_DATA request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    /// The peer holds the value.
    Value(String),
    /// The peer does not hold the value; these are the closest contacts it knows.
    Contacts(Vec<Contact>),
}

/// Network abstraction for DHT RPC operations.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Ping a contact. Returns the contact the peer reports for itself.
    async fn ping(&self, to: &Contact) -> Result<Contact>;

    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Send a FIND_DATA RPC to retrieve a value or get closer contacts.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply>;

    /// Send a STORE RPC. Returns whether the peer accepted the pair.
    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<bool>;
}

/// [`DhtNetwork`] over plain UDP datagrams.
#[derive(Clone, Debug)]
pub struct UdpNetwork {
    self_contact: Contact,
    rpc_timeout: Duration,
}

impl UdpNetwork {
    pub fn new(self_contact: Contact, rpc_timeout: Duration) -> Self {
        Self {
            self_contact,
            rpc_timeout,
        }
    }

    /// Ping a bare address, before the peer's id is known.
    pub async fn ping_addr(&self, address: SocketAddr) -> Result<Contact> {
        let reply = self.request(address, MessageKind::Ping).await?;
        match reply.kind {
            MessageKind::Pong => Ok(reply.from),
            other => Err(unexpected(address, "PONG", &other)),
        }
    }

    /// Send one request and wait for its reply or the deadline.
    pub async fn request(&self, address: SocketAddr, kind: MessageKind) -> Result<Message> {
        let request = Message::request(self.self_contact.clone(), kind);
        let payload = request.encode()?;

        let socket = UdpSocket::bind(unspecified_for(&address)).await?;
        socket.connect(address).await?;
        socket.send(&payload).await?;
        trace!(%address, kind = request.kind.name(), rpc_id = request.rpc_id, "request sent");

        let deadline = Instant::now() + self.rpc_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let len = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Err(DhtError::Timeout { address }),
            };
            let reply = match Message::decode(&buf[..len]) {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(%address, "discarding undecodable reply: {err}");
                    continue;
                }
            };
            if reply.rpc_id != request.rpc_id {
                debug!(%address, rpc_id = reply.rpc_id, "discarding stale reply");
                continue;
            }
            if reply.kind == MessageKind::Error {
                return Err(DhtError::Rejected { address });
            }
            return Ok(reply);
        }
    }
}

#[async_trait]
impl DhtNetwork for UdpNetwork {
    async fn ping(&self, to: &Contact) -> Result<Contact> {
        self.ping_addr(to.address).await
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let reply = self
            .request(to.address, MessageKind::FindNode { target })
            .await?;
        match reply.kind {
            MessageKind::FoundContacts { contacts } => Ok(contacts),
            other => Err(unexpected(to.address, "FOUND_CONTACTS", &other)),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
        let reply = self
            .request(to.address, MessageKind::FindData { key })
            .await?;
        match reply.kind {
            MessageKind::FoundData {
                value: Some(value), ..
            } => Ok(FindValueReply::Value(value)),
            MessageKind::FoundData { contacts, .. } => Ok(FindValueReply::Contacts(contacts)),
            other => Err(unexpected(to.address, "FOUND_DATA", &other)),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<bool> {
        let reply = self
            .request(to.address, MessageKind::Store { key, value })
            .await?;
        match reply.kind {
            MessageKind::StoreResponse { store_success } => Ok(store_success),
            other => Err(unexpected(to.address, "STORE_RESPONSE", &other)),
        }
    }
}

fn unexpected(address: SocketAddr, wanted: &str, got: &MessageKind) -> DhtError {
    DhtError::InvalidMessage(format!(
        "{address} answered {} where {wanted} was expected",
        got.name()
    ))
}

fn unspecified_for(address: &SocketAddr) -> SocketAddr {
    let ip = match address.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
