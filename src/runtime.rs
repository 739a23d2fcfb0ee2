//! A DHT node running over UDP.
//!
//! [`KademliaNode`] is what applications hold: it binds the listening socket,
//! wires a [`DhtNode`] to a [`UdpNetwork`], and exposes the node's lifecycle
//! (`start`, `join`) alongside the storage operations and diagnostics a console
//! or object-storage front end needs.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::{DhtError, Result};
use crate::events::EventSink;
use crate::id::{Key, NodeId};
use crate::net::UdpNetwork;
use crate::node::{DhtNode, FindValueResult, NodeSnapshot};
use crate::routing::Contact;
use crate::server::serve;

/// A Kademlia node bound to a UDP socket.
pub struct KademliaNode {
    inner: Arc<DhtNode<UdpNetwork>>,
    socket: Arc<UdpSocket>,
}

impl Clone for KademliaNode {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            socket: self.socket.clone(),
        }
    }
}

impl KademliaNode {
    /// Bind the listening socket and build the node.
    ///
    /// The bootstrap node takes the well-known bootstrap id; every other node
    /// draws a random one. A bind failure is returned as [`DhtError::Bind`]:
    /// without a transport the node cannot do anything.
    pub async fn bind(config: NodeConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.params.validate()?;
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| DhtError::Bind {
                address: config.bind_addr,
                source,
            })?;
        let local = socket.local_addr()?;

        let mut advertise = config.advertise_addr;
        if advertise.port() == 0 {
            advertise.set_port(local.port());
        }

        let id = if config.is_bootstrap {
            NodeId::bootstrap()
        } else {
            NodeId::random()
        };
        let me = Contact::new(id, advertise);
        let network = UdpNetwork::new(me.clone(), config.params.rpc_timeout);
        let mut node = DhtNode::new(me, network, config.params.clone(), events);
        if !config.is_bootstrap {
            let seed = config.bootstrap_addr.ok_or_else(|| {
                DhtError::Config("a non-bootstrap node needs a bootstrap address".into())
            })?;
            node = node.with_bootstrap(seed);
        }

        Ok(Self {
            inner: Arc::new(node),
            socket: Arc::new(socket),
        })
    }

    /// Spawn the listener task.
    pub fn start(&self) -> JoinHandle<Result<()>> {
        info!(id = %self.id(), addr = %self.address(), "node listening");
        tokio::spawn(serve(self.inner.clone(), self.socket.clone()))
    }

    /// Join the network through the configured bootstrap node.
    pub async fn join(&self) -> Result<()> {
        self.inner.join().await
    }

    /// Store a value in the DHT, returning its key.
    pub async fn store(&self, value: impl Into<String>) -> Result<Key> {
        self.inner.store(value.into()).await
    }

    /// Look up the value at `key`.
    pub async fn get(&self, key: &Key) -> Result<FindValueResult> {
        self.inner.get(key).await
    }

    /// Closest contacts to `target` found by an iterative lookup.
    pub async fn lookup_contact(&self, target: NodeId) -> Vec<Contact> {
        self.inner.lookup_contact(target).await
    }

    pub fn id(&self) -> NodeId {
        self.inner.id()
    }

    pub fn contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    /// Address peers reach this node at.
    pub fn address(&self) -> SocketAddr {
        self.inner.self_contact.address
    }

    pub async fn routing_contacts(&self) -> Vec<Contact> {
        self.inner.routing_contacts().await
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        self.inner.snapshot().await
    }

    /// The underlying engine.
    pub fn dht(&self) -> &Arc<DhtNode<UdpNetwork>> {
        &self.inner
    }
}
