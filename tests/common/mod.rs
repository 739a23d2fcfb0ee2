use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use kademlia_dht::id::ID_LENGTH;
use kademlia_dht::{
    handle_datagram, Contact, DhtError, DhtNetwork, DhtNode, DhtParams, FindValueReply, Key,
    MemorySink, NodeId, Result,
};
use kademlia_dht::protocol::{Message, MessageKind};

/// In-memory network that delivers requests by encoding them, running the
/// receiving node's datagram handler and decoding the reply.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<SocketAddr, Duration>>>,
    failures: Arc<Mutex<HashSet<SocketAddr>>>,
    stores: Arc<Mutex<Vec<(Contact, Key)>>>,
    pings: Arc<Mutex<Vec<SocketAddr>>>,
    requests: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// Counts a request as outstanding until dropped, including when the caller
/// abandons it mid-flight.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            stores: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn set_latency(&self, addr: SocketAddr, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(addr, latency);
    }

    pub async fn set_failure(&self, addr: SocketAddr, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(addr);
        } else {
            failures.remove(&addr);
        }
    }

    pub async fn store_calls(&self) -> Vec<(Contact, Key)> {
        let stores = self.stores.lock().await;
        stores.clone()
    }

    pub async fn ping_calls(&self) -> Vec<SocketAddr> {
        let calls = self.pings.lock().await;
        calls.clone()
    }

    /// Requests sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Most requests that were ever outstanding at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn request(&self, to: SocketAddr, kind: MessageKind) -> Result<Message> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _outstanding = InFlight(&self.in_flight);

        if self.should_fail(&to).await {
            return Err(DhtError::Timeout { address: to });
        }
        self.maybe_sleep(&to).await;
        let Some(peer) = self.registry.get(&to).await else {
            return Err(DhtError::Timeout { address: to });
        };
        let request = Message::request(self.self_contact.clone(), kind);
        let Some(reply) = handle_datagram(&peer, &request.encode()?).await else {
            return Err(DhtError::Timeout { address: to });
        };
        let reply = Message::decode(&reply.encode()?)?;
        if reply.kind == MessageKind::Error {
            return Err(DhtError::Rejected { address: to });
        }
        Ok(reply)
    }

    async fn should_fail(&self, addr: &SocketAddr) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(addr)
    }

    async fn maybe_sleep(&self, addr: &SocketAddr) {
        let latency = {
            let latencies = self.latencies.lock().await;
            latencies.get(addr).copied()
        };
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }
}

fn unexpected(kind: &MessageKind) -> DhtError {
    DhtError::InvalidMessage(format!("unexpected {}", kind.name()))
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn ping(&self, to: &Contact) -> Result<Contact> {
        {
            let mut calls = self.pings.lock().await;
            calls.push(to.address);
        }
        let reply = self.request(to.address, MessageKind::Ping).await?;
        match reply.kind {
            MessageKind::Pong => Ok(reply.from),
            other => Err(unexpected(&other)),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let reply = self
            .request(to.address, MessageKind::FindNode { target })
            .await?;
        match reply.kind {
            MessageKind::FoundContacts { contacts } => Ok(contacts),
            other => Err(unexpected(&other)),
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
            other => Err(unexpected(&other)),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<bool> {
        {
            let mut stores = self.stores.lock().await;
            stores.push((to.clone(), key));
        }
        let reply = self
            .request(to.address, MessageKind::Store { key, value })
            .await?;
        match reply.kind {
            MessageKind::StoreResponse { store_success } => Ok(store_success),
            other => Err(unexpected(&other)),
        }
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<SocketAddr, Arc<DhtNode<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Arc<DhtNode<TestNetwork>>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.self_contact.address, node.clone());
    }

    pub async fn unregister(&self, addr: &SocketAddr) {
        let mut peers = self.peers.write().await;
        peers.remove(addr);
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<DhtNode<TestNetwork>>> {
        let peers = self.peers.read().await;
        peers.get(addr).cloned()
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: TestNetwork,
    pub events: Arc<MemorySink>,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, params: DhtParams) -> Self {
        Self::with_id(registry, make_node_id(index), index, params, None).await
    }

    pub async fn with_id(
        registry: Arc<NetworkRegistry>,
        id: NodeId,
        index: u32,
        params: DhtParams,
        bootstrap: Option<SocketAddr>,
    ) -> Self {
        let contact = Contact::new(id, make_addr(index));
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let events = Arc::new(MemorySink::new());
        let mut node = DhtNode::new(contact, network.clone(), params, events.clone());
        if let Some(seed) = bootstrap {
            node = node.with_bootstrap(seed);
        }
        let node = Arc::new(node);
        registry.register(&node).await;
        Self {
            node,
            network,
            events,
        }
    }

    pub fn contact(&self) -> Contact {
        self.node.self_contact.clone()
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }
}

pub fn params(k: usize, alpha: usize, width: usize) -> DhtParams {
    DhtParams {
        k,
        alpha,
        retrieval_width: width,
        ..DhtParams::default()
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; ID_LENGTH];
    id[..4].copy_from_slice(&index.to_be_bytes());
    NodeId::from_bytes(id)
}

pub fn make_addr(index: u32) -> SocketAddr {
    let [_, _, hi, lo] = index.to_be_bytes();
    SocketAddr::from(([10, 0, hi, lo], 4000))
}

/// Ids of the `count` contacts closest to `target`, by brute force.
pub fn brute_force_closest(ids: &[NodeId], target: &NodeId, count: usize) -> Vec<NodeId> {
    let mut sorted = ids.to_vec();
    sorted.sort_by_key(|id| id.distance(target));
    sorted.truncate(count);
    sorted
}
