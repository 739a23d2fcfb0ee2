//! The DHT node: request handlers and the Join / Store / Get operations.
//!
//! [`DhtNode`] is generic over its [`DhtNetwork`] so tests can drive whole
//! networks in memory while [`KademliaNode`](crate::KademliaNode) runs it over
//! UDP.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DhtParams;
use crate::error::{DhtError, Result};
use crate::events::EventSink;
use crate::id::{hash_content, verify_key_value_pair, Key, NodeId};
use crate::lookup::{LookupKind, LookupOutcome};
use crate::net::{DhtNetwork, FindValueReply};
use crate::routing::{AddOutcome, Contact, RoutingTable};
use crate::store::DataStore;

/// Result of a value lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindValueResult {
    /// The value, if any peer (or this node) held it.
    pub value: Option<String>,
    /// Closest contacts to the key, useful for retrying a store there.
    pub contacts: Vec<Contact>,
}

impl FindValueResult {
    pub fn found(&self) -> bool {
        self.value.is_some()
    }
}

/// Diagnostic view of a node.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub address: std::net::SocketAddr,
    pub contacts: Vec<Contact>,
    pub stored_keys: usize,
}

/// Kademlia node state machine.
///
/// A `DhtNode` owns a routing table, a local store, and the network used to
/// reach other peers. The type is `Arc`-friendly and shared between the
/// listener and every in-flight operation.
///
/// # Key Methods
///
/// * [`observe_contact`](Self::observe_contact) - Update the routing table when a peer is seen
/// * [`lookup`](Self::lookup) - Iterative FIND_NODE / FIND_DATA search
/// * [`join`](Self::join), [`store`](Self::store), [`get`](Self::get) - Façade operations
/// * `handle_*` - Inbound request handlers used by [`crate::server`]
pub struct DhtNode<N: DhtNetwork> {
    /// Contact info for this node (ID + address).
    pub self_contact: Contact,
    pub(crate) routing: Arc<Mutex<RoutingTable>>,
    pub(crate) store: DataStore,
    pub(crate) network: Arc<N>,
    pub(crate) params: DhtParams,
    pub(crate) events: Arc<dyn EventSink>,
    /// Seed contacted by [`join`](Self::join); `None` on the seed itself.
    bootstrap: Option<std::net::SocketAddr>,
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a node with an empty routing table and store.
    pub fn new(
        self_contact: Contact,
        network: N,
        params: DhtParams,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let routing = RoutingTable::new(self_contact.clone(), params.k);
        let store = DataStore::new(params.ttl, events.clone());
        Self {
            self_contact,
            routing: Arc::new(Mutex::new(routing)),
            store,
            network: Arc::new(network),
            params,
            events,
            bootstrap: None,
        }
    }

    /// Configure the seed address that [`join`](Self::join) contacts.
    pub fn with_bootstrap(mut self, bootstrap: std::net::SocketAddr) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn id(&self) -> NodeId {
        self.self_contact.id
    }

    pub fn params(&self) -> &DhtParams {
        &self.params
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// The local store, for diagnostics and direct manipulation in tests.
    pub fn data_store(&self) -> &DataStore {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────────

    /// Observe a contact and update the routing table.
    ///
    /// If the contact's bucket is full, a background task pings the least
    /// recently seen contact and evicts it only if it does not answer.
    pub async fn observe_contact(&self, contact: Contact) {
        let outcome = {
            let mut rt = self.routing.lock().await;
            rt.add_contact(contact)
        };
        if let AddOutcome::Full { oldest, candidate } = outcome {
            self.spawn_bucket_refresh(oldest, candidate);
        }
    }

    /// Ping the oldest contact of a full bucket and apply the verdict.
    fn spawn_bucket_refresh(&self, oldest: Contact, candidate: Contact) {
        let network = self.network.clone();
        let routing = self.routing.clone();
        tokio::spawn(async move {
            let alive = match network.ping(&oldest).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(
                        peer = %oldest.id,
                        addr = %oldest.address,
                        "ping failed, evicting: {err}"
                    );
                    false
                }
            };
            let mut rt = routing.lock().await;
            rt.resolve_full_bucket(&oldest, candidate, alive);
        });
    }

    /// Up to `count` known contacts closest to `target`.
    pub async fn closest_contacts(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let rt = self.routing.lock().await;
        rt.find_closest_contacts(target, count)
    }

    /// Every contact in the routing table.
    pub async fn routing_contacts(&self) -> Vec<Contact> {
        let rt = self.routing.lock().await;
        rt.contacts()
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id(),
            address: self.self_contact.address,
            contacts: self.routing_contacts().await,
            stored_keys: self.store.len().await,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound handlers
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle an incoming FIND_NODE RPC request.
    ///
    /// The sender has already been observed by the dispatcher.
    pub async fn handle_find_node_request(&self, target: &NodeId) -> Vec<Contact> {
        self.closest_contacts(target, self.params.retrieval_width)
            .await
    }

    /// Handle an incoming FIND_DATA RPC request.
    ///
    /// Returns the value if we hold it, otherwise the closest contacts we know.
    pub async fn handle_find_value_request(&self, key: &Key) -> FindValueReply {
        match self.store.get(key).await {
            Ok(value) => FindValueReply::Value(value),
            Err(_) => FindValueReply::Contacts(
                self.closest_contacts(&key.as_node_id(), self.params.retrieval_width)
                    .await,
            ),
        }
    }

    /// Handle an incoming STORE RPC request.
    ///
    /// Pairs whose key is not the digest of the value are refused.
    pub async fn handle_store_request(&self, from: &Contact, key: Key, value: String) -> bool {
        if !verify_key_value_pair(&key, value.as_bytes()) {
            warn!(peer = %from.id, key = %key, "refusing store with mismatched key");
            return false;
        }
        self.store.insert(key, value).await;
        debug!(peer = %from.id, key = %key, "stored value for peer");
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Façade
    // ─────────────────────────────────────────────────────────────────────────

    /// Join the network through the configured bootstrap node.
    ///
    /// The seed itself has nothing to join. Everyone else pings the seed, looks
    /// up its own id to populate the neighbourhood, then looks up a random id in
    /// the half of the id space (split at the seed's id) that the first lookup
    /// did not walk through.
    pub async fn join(&self) -> Result<()> {
        let Some(address) = self.bootstrap else {
            info!(id = %self.id(), "this node is the bootstrap node");
            return Ok(());
        };

        let seed = Contact::new(NodeId::ZERO, address);
        let seed = self.network.ping(&seed).await.map_err(|err| {
            self.events
                .log(format!("Join failed: bootstrap {address} did not answer: {err}"));
            DhtError::JoinFailed(format!("bootstrap {address} unreachable: {err}"))
        })?;
        self.observe_contact(seed.clone()).await;

        let own = self.lookup(LookupKind::FindContact, self.id()).await;
        debug!(found = own.contacts.len(), "self lookup finished");

        let (low, high) = if self.id() < seed.id {
            (seed.id, NodeId::MAX)
        } else {
            (NodeId::ZERO, seed.id)
        };
        let far = NodeId::random_in_range(&low, &high)?;
        let other = self.lookup(LookupKind::FindContact, far).await;
        debug!(target = %far, found = other.contacts.len(), "coverage lookup finished");

        let known = self.routing.lock().await.len();
        self.events.log(format!(
            "Joined the DHT through {} ({}); {known} contacts known",
            seed.id, seed.address
        ));
        Ok(())
    }

    /// Store a value on the peers closest to its key.
    ///
    /// Replication is best effort: failed STORE requests are logged, not
    /// retried. Fails with [`DhtError::NoTargetNodes`] if no peer is known.
    pub async fn store(&self, value: String) -> Result<Key> {
        let key = hash_content(value.as_bytes());
        let LookupOutcome { contacts, .. } =
            self.lookup(LookupKind::FindContact, key.as_node_id()).await;
        if contacts.is_empty() {
            return Err(DhtError::NoTargetNodes);
        }

        let sends = contacts.iter().map(|contact| {
            let value = value.clone();
            async move { (contact, self.network.store(contact, key, value).await) }
        });
        for (contact, result) in join_all(sends).await {
            match result {
                Ok(true) => self.observe_contact(contact.clone()).await,
                Ok(false) => debug!(peer = %contact.id, key = %key, "peer refused store"),
                Err(err) => self.events.log(format!(
                    "STORE of {key} to {} failed: {err}",
                    contact.address
                )),
            }
        }
        Ok(key)
    }

    /// Look up the value at `key`.
    ///
    /// A local hit is answered without touching the network. Otherwise the
    /// lookup result carries either the value or the closest contacts found.
    pub async fn get(&self, key: &Key) -> Result<FindValueResult> {
        if let Ok(value) = self.store.get(key).await {
            return Ok(FindValueResult {
                value: Some(value),
                contacts: Vec::new(),
            });
        }
        let outcome = self.lookup(LookupKind::FindValue, key.as_node_id()).await;
        Ok(FindValueResult {
            value: outcome.value,
            contacts: outcome.contacts,
        })
    }

    /// Perform an iterative lookup for the contacts closest to `target`.
    pub async fn lookup_contact(&self, target: NodeId) -> Vec<Contact> {
        self.lookup(LookupKind::FindContact, target).await.contacts
    }
}
