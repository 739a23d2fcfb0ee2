//! Protocol parameters and process configuration.
//!
//! [`DhtParams`] holds the tunables of the Kademlia engine itself. [`NodeConfig`]
//! describes a running process: where it listens, how it is reached, and which
//! peer it joins through. The binary builds it from environment variables with
//! [`NodeConfig::from_env`].

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use tokio::net::lookup_host;
use tokio::time::Duration;

use crate::error::{DhtError, Result};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default bucket size.
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

/// Default number of contacts returned by FIND_NODE / FIND_DATA and kept in a
/// lookup shortlist.
pub const DEFAULT_RETRIEVAL_WIDTH: usize = 20;

/// Default per-request timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time-to-live of a stored value (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Smallest bucket size the routing table accepts.
const MIN_K: usize = 3;

// ============================================================================
// Engine Parameters
// ============================================================================

/// Tunables of the Kademlia engine.
#[derive(Clone, Debug)]
pub struct DhtParams {
    /// Maximum contacts per bucket.
    pub k: usize,
    /// Requests issued concurrently per lookup round.
    pub alpha: usize,
    /// Contacts returned per query and kept in a lookup shortlist.
    pub retrieval_width: usize,
    /// Deadline of a single request.
    pub rpc_timeout: Duration,
    /// Lifetime of a stored value since its last insert or access.
    pub ttl: Duration,
}

impl Default for DhtParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            retrieval_width: DEFAULT_RETRIEVAL_WIDTH,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            ttl: DEFAULT_TTL,
        }
    }
}

impl DhtParams {
    /// Reject parameter combinations the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.k < MIN_K {
            return Err(DhtError::Config(format!(
                "bucket size must be at least {MIN_K}, got {}",
                self.k
            )));
        }
        if self.alpha == 0 || self.retrieval_width == 0 {
            return Err(DhtError::Config(
                "alpha and retrieval width must be positive".into(),
            ));
        }
        if self.rpc_timeout.is_zero() || self.ttl.is_zero() {
            return Err(DhtError::Config(
                "timeouts and ttl must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Process Configuration
// ============================================================================

/// Configuration of one node process.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Local address the UDP listener binds to.
    pub bind_addr: SocketAddr,
    /// Address other peers use to reach this node.
    pub advertise_addr: SocketAddr,
    /// Whether this node is the network's seed.
    pub is_bootstrap: bool,
    /// Address of the seed, required unless `is_bootstrap`.
    pub bootstrap_addr: Option<SocketAddr>,
    pub params: DhtParams,
}

impl NodeConfig {
    /// A configuration for a node listening on `127.0.0.1` at `port`.
    ///
    /// Port `0` asks the OS for a free port; the advertised address is then
    /// fixed up once the socket is bound.
    pub fn local(port: u16) -> Self {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Self {
            bind_addr: addr,
            advertise_addr: addr,
            is_bootstrap: false,
            bootstrap_addr: None,
            params: DhtParams::default(),
        }
    }

    /// Read the configuration from the process environment.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `NODE_PORT` | UDP port to listen on (required) |
    /// | `NODE_HOST` | Host other peers reach us at |
    /// | `IS_BOOTSTRAP` | `true` if this node is the seed |
    /// | `BOOTSTRAP_NODE_HOSTNAME` / `BOOTSTRAP_NODE_PORT` | Seed address |
    /// | `DHT_K`, `DHT_ALPHA`, `DHT_TTL_SECS`, `DHT_RPC_TIMEOUT_MS` | Overrides |
    pub async fn from_env() -> Result<Self> {
        let port: u16 = required("NODE_PORT")?;
        let is_bootstrap = env::var("IS_BOOTSTRAP")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let advertise_ip = match env::var("NODE_HOST") {
            Ok(host) => resolve(&host, port).await?.ip(),
            Err(_) => local_ip().await,
        };

        let bootstrap_addr = if is_bootstrap {
            None
        } else {
            let host = env::var("BOOTSTRAP_NODE_HOSTNAME")
                .map_err(|_| DhtError::Config("BOOTSTRAP_NODE_HOSTNAME is not set".into()))?;
            let bootstrap_port: u16 = required("BOOTSTRAP_NODE_PORT")?;
            Some(resolve(&host, bootstrap_port).await?)
        };

        let mut params = DhtParams::default();
        if let Some(k) = optional("DHT_K")? {
            params.k = k;
        }
        if let Some(alpha) = optional("DHT_ALPHA")? {
            params.alpha = alpha;
        }
        if let Some(secs) = optional::<u64>("DHT_TTL_SECS")? {
            params.ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = optional::<u64>("DHT_RPC_TIMEOUT_MS")? {
            params.rpc_timeout = Duration::from_millis(ms);
        }
        params.validate()?;

        Ok(Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            advertise_addr: SocketAddr::new(advertise_ip, port),
            is_bootstrap,
            bootstrap_addr,
            params,
        })
    }
}

fn required<T: FromStr>(name: &str) -> Result<T> {
    optional(name)?.ok_or_else(|| DhtError::Config(format!("{name} is not set")))
}

fn optional<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DhtError::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| DhtError::Config(format!("{host} did not resolve to any address")))
}

/// First address the local hostname resolves to, or loopback.
async fn local_ip() -> IpAddr {
    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    match resolve(&hostname, 0).await {
        Ok(addr) => addr.ip(),
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
