//! # kademlia-dht
//!
//! A Kademlia distributed hash table node. Peers are indexed by the XOR
//! distance between 160-bit identifiers; values are stored under the SHA-1
//! digest of their bytes on the peers closest to that digest, and found again
//! by iteratively asking peers that are progressively closer to it.
//!
//! The crate is split into modules that can be used independently:
//!
//! - [`id`]: identifiers, content keys and the XOR metric.
//! - [`routing`]: contacts, k-buckets and the [`RoutingTable`].
//! - [`store`]: the local [`DataStore`] with per-key expiration.
//! - [`protocol`]: the JSON messages exchanged in UDP datagrams.
//! - [`net`]: the [`DhtNetwork`] capability and its [`UdpNetwork`] implementation.
//! - [`lookup`]: the bounded-concurrency iterative lookup.
//! - [`node`]: the [`DhtNode`] engine with its Join / Store / Get operations.
//! - [`server`]: inbound message dispatch and the UDP listener loop.
//! - [`runtime`]: [`KademliaNode`], a node bound to a UDP socket.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kademlia_dht::{KademliaNode, NodeConfig, TracingSink};
//!
//! # async fn launch() -> kademlia_dht::Result<()> {
//! let mut config = NodeConfig::local(0);
//! config.bootstrap_addr = Some("127.0.0.1:4000".parse().unwrap());
//!
//! let node = KademliaNode::bind(config, Arc::new(TracingSink)).await?;
//! node.start();
//! node.join().await?;
//!
//! let key = node.store("hello").await?;
//! let found = node.get(&key).await?;
//! assert_eq!(found.value.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod lookup;
pub mod net;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod runtime;
pub mod server;
pub mod store;

pub use config::{DhtParams, NodeConfig};
pub use error::{DhtError, Result};
pub use events::{EventSink, MemorySink, TracingSink};
pub use id::{hash_content, verify_key_value_pair, Key, NodeId};
pub use lookup::{LookupKind, LookupOutcome, Termination};
pub use net::{DhtNetwork, FindValueReply, UdpNetwork};
pub use node::{DhtNode, FindValueResult, NodeSnapshot};
pub use routing::{AddOutcome, Contact, RoutingTable};
pub use runtime::KademliaNode;
pub use server::handle_datagram;
pub use store::DataStore;
