//! Identifiers, content keys and the XOR metric.
//!
//! - **Identity**: [`NodeId`] is a 160-bit identifier with a total lexicographic order
//! - **Content addressing**: [`Key`] is the SHA-1 digest of a stored value
//! - **Distance**: [`NodeId::distance`] implements the Kademlia XOR metric

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::DhtError;

/// Number of bytes in an identifier.
pub const ID_LENGTH: usize = 20;

/// Number of bits in an identifier, and therefore the number of routing buckets.
pub const ID_BITS: usize = ID_LENGTH * 8;

/// Identifier taken by the well-known bootstrap node.
pub const BOOTSTRAP_ID_HEX: &str = "ffffffff00000000000000000000000000000000";

// ============================================================================
// Node Identifier
// ============================================================================

/// A 160-bit identifier for DHT nodes.
///
/// Ordering is lexicographic over the bytes, which is the same as comparing the
/// identifiers as big-endian unsigned integers. XOR distances are identifiers
/// too and compare the same way.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; ID_LENGTH]);

impl NodeId {
    /// The all-zero identifier.
    pub const ZERO: NodeId = NodeId([0u8; ID_LENGTH]);

    /// The all-ones identifier, the largest point of the id space.
    pub const MAX: NodeId = NodeId([0xff; ID_LENGTH]);

    pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Draw a uniformly random identifier.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Draw a random identifier within the inclusive range `[low, high]`.
    ///
    /// Bytes are drawn from most to least significant; while the prefix drawn so
    /// far still equals a bound's prefix, the next byte is clamped to that bound.
    ///
    /// ```
    /// use kademlia_dht::NodeId;
    ///
    /// let low: NodeId = "8000000000000000000000000000000000000000".parse().unwrap();
    /// let id = NodeId::random_in_range(&low, &NodeId::MAX).unwrap();
    /// assert!(id >= low);
    /// ```
    pub fn random_in_range(low: &NodeId, high: &NodeId) -> Result<Self, DhtError> {
        if low > high {
            return Err(DhtError::InvalidIdentifier(format!(
                "range low bound {low} is above high bound {high}"
            )));
        }
        let mut rng = rand::thread_rng();
        let mut out = [0u8; ID_LENGTH];
        let mut on_low = true;
        let mut on_high = true;
        for i in 0..ID_LENGTH {
            let min = if on_low { low.0[i] } else { 0x00 };
            let max = if on_high { high.0[i] } else { 0xff };
            let byte = rng.gen_range(min..=max);
            on_low &= byte == low.0[i];
            on_high &= byte == high.0[i];
            out[i] = byte;
        }
        Ok(Self(out))
    }

    /// The identifier of the well-known bootstrap node.
    pub fn bootstrap() -> Self {
        let mut out = [0u8; ID_LENGTH];
        out[..4].copy_from_slice(&[0xff; 4]);
        Self(out)
    }

    /// Compute the XOR distance between two identifiers.
    ///
    /// # Properties
    /// - `a.distance(&a) == NodeId::ZERO`
    /// - `a.distance(&b) == b.distance(&a)`
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Index of the most significant set bit, counting from the top (0..160).
    ///
    /// Returns `None` for the zero identifier.
    pub fn leading_bit(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(idx, byte)| idx * 8 + byte.leading_zeros() as usize)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)
            .map_err(|err| DhtError::InvalidIdentifier(format!("{s:?}: {err}")))?;
        let bytes: [u8; ID_LENGTH] = decoded.try_into().map_err(|_| {
            DhtError::InvalidIdentifier(format!(
                "{s:?}: expected {} hex characters",
                ID_LENGTH * 2
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Content Key
// ============================================================================

/// A content-addressed key: the SHA-1 digest of the stored value.
///
/// Keys live in the same space as node identifiers so that "find the value at
/// `K`" and "find the peers closest to `K`" share one lookup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(NodeId);

impl Key {
    pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(NodeId::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        self.0.as_bytes()
    }

    /// The identifier this key maps to in the routing space.
    pub fn as_node_id(&self) -> NodeId {
        self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl From<NodeId> for Key {
    fn from(id: NodeId) -> Self {
        Self(id)
    }
}

impl From<Key> for NodeId {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0.to_hex())
    }
}

impl FromStr for Key {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<NodeId>().map(Key)
    }
}

/// Compute the content key of a value as its SHA-1 digest.
///
/// ```
/// use kademlia_dht::hash_content;
///
/// let key = hash_content(b"hello");
/// assert_eq!(key.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
/// ```
pub fn hash_content(data: &[u8]) -> Key {
    let digest = Sha1::digest(data);
    let mut out = [0u8; ID_LENGTH];
    out.copy_from_slice(&digest);
    Key::from_bytes(out)
}

/// Verify that a key is the digest of a value.
pub fn verify_key_value_pair(key: &Key, value: &[u8]) -> bool {
    hash_content(value) == *key
}
