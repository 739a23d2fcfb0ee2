//! Contacts, k-buckets and the routing table.
//!
//! The routing table keeps one bucket per bit of the identifier. A contact
//! lands in the bucket whose index is the position of the first bit where its
//! id differs from ours, so bucket 0 holds the half of the id space furthest
//! from us and bucket 159 the closest sliver.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::id::{NodeId, ID_BITS};

// ─────────────────────────────────────────────────────────────────────────────
// Contact
// ─────────────────────────────────────────────────────────────────────────────

/// Another DHT node: its identifier and the UDP address it answers on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub address: SocketAddr,
    /// Distance to the current lookup target; only set while sorting.
    #[serde(skip)]
    pub distance: Option<NodeId>,
}

impl Contact {
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            distance: None,
        }
    }

    /// Record this contact's distance to `target`.
    pub fn calc_distance(&mut self, target: &NodeId) {
        self.distance = Some(self.id.distance(target));
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.address.hash(state);
    }
}

/// Sort contacts by ascending XOR distance to `target`, filling in `distance`.
pub fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    for contact in contacts.iter_mut() {
        contact.calc_distance(target);
    }
    contacts.sort_by_key(|c| c.distance);
}

/// Find the bucket index for `other` relative to `self_id`.
///
/// Returns `None` when the ids are identical: the local id has no bucket.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> Option<usize> {
    self_id.distance(other).leading_bit()
}

// ─────────────────────────────────────────────────────────────────────────────
// Bucket
// ─────────────────────────────────────────────────────────────────────────────

/// A single k-bucket, most recently seen contact first.
#[derive(Debug, Default, Clone)]
pub struct Bucket {
    contacts: VecDeque<Contact>,
}

/// Outcome of offering a contact to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The contact was new and the bucket had room.
    Inserted,
    /// The contact was already known and moved to the front.
    Refreshed,
    /// The contact carries our own id and was ignored.
    SelfReference,
    /// The bucket is full; `oldest` must be pinged before `candidate` can enter.
    Full { oldest: Contact, candidate: Contact },
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            contacts: VecDeque::new(),
        }
    }

    /// Add or refresh a contact.
    ///
    /// - If the contact exists, it moves to the front (most recently seen)
    /// - If the bucket has space, the contact is pushed to the front
    /// - If the bucket is full, the least recently seen contact is reported
    fn touch(&mut self, contact: Contact, k: usize) -> AddOutcome {
        if let Some(pos) = self.position(&contact.id) {
            if let Some(mut existing) = self.contacts.remove(pos) {
                existing.address = contact.address;
                self.contacts.push_front(existing);
            }
            return AddOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push_front(contact);
            return AddOutcome::Inserted;
        }

        match self.contacts.back() {
            Some(oldest) => AddOutcome::Full {
                oldest: oldest.clone(),
                candidate: contact,
            },
            // k == 0: nothing can ever enter.
            None => AddOutcome::Refreshed,
        }
    }

    /// Move a known contact to the front. Returns false if it is absent.
    fn refresh(&mut self, id: &NodeId) -> bool {
        match self.position(id).and_then(|pos| self.contacts.remove(pos)) {
            Some(existing) => {
                self.contacts.push_front(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => self.contacts.remove(pos).is_some(),
            None => false,
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Contacts from most to least recently seen.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Kademlia routing table with one bucket per identifier bit.
#[derive(Debug)]
pub struct RoutingTable {
    me: Contact,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Create an empty routing table for the local contact.
    pub fn new(me: Contact, k: usize) -> Self {
        Self {
            me,
            k,
            buckets: vec![Bucket::new(); ID_BITS],
        }
    }

    /// The local node's own contact.
    pub fn me(&self) -> &Contact {
        &self.me
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a contact.
    ///
    /// A full bucket is left untouched; the caller decides through
    /// [`resolve_full_bucket`](Self::resolve_full_bucket) once the oldest
    /// contact has been pinged.
    pub fn add_contact(&mut self, contact: Contact) -> AddOutcome {
        let Some(idx) = bucket_index(&self.me.id, &contact.id) else {
            return AddOutcome::SelfReference;
        };
        let mut contact = contact;
        contact.distance = None;
        self.buckets[idx].touch(contact, self.k)
    }

    /// Apply the result of probing the oldest contact of a full bucket.
    ///
    /// A live `oldest` is moved to the front and `candidate` is dropped. A dead
    /// one is evicted and `candidate` takes its place.
    pub fn resolve_full_bucket(&mut self, oldest: &Contact, candidate: Contact, oldest_alive: bool) {
        let Some(idx) = bucket_index(&self.me.id, &candidate.id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        if oldest_alive {
            bucket.refresh(&oldest.id);
            return;
        }

        bucket.remove(&oldest.id);
        if bucket.contains(&candidate.id) {
            return;
        }
        if bucket.len() < self.k {
            bucket.contacts.push_front(candidate);
        }
    }

    /// Forget a contact entirely.
    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        match bucket_index(&self.me.id, id) {
            Some(idx) => self.buckets[idx].remove(id),
            None => false,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        bucket_index(&self.me.id, id).is_some_and(|idx| self.buckets[idx].contains(id))
    }

    /// Find up to `count` known contacts closest to `target`, nearest first.
    ///
    /// Buckets are visited in order of their distance to the target: the
    /// target's own bucket, then every deeper bucket (all of whose contacts are
    /// equally far at the top bit), then the shallower buckets one at a time.
    /// Scanning stops at the first tier boundary where `count` contacts have
    /// been gathered, so the sorted prefix is exact.
    pub fn find_closest_contacts(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let start = bucket_index(&self.me.id, target).unwrap_or(ID_BITS);
        let mut gathered: Vec<Contact> = Vec::new();

        if start < ID_BITS {
            gathered.extend(self.buckets[start].contacts().cloned());
            if gathered.len() < count {
                for bucket in &self.buckets[start + 1..] {
                    gathered.extend(bucket.contacts().cloned());
                }
            }
        }
        for bucket in self.buckets[..start].iter().rev() {
            if gathered.len() >= count {
                break;
            }
            gathered.extend(bucket.contacts().cloned());
        }

        sort_by_distance(&mut gathered, target);
        gathered.truncate(count);
        gathered
    }

    /// Every known contact, bucket by bucket.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts().cloned())
            .collect()
    }

    /// Read access to a single bucket.
    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    /// Total number of contacts in the table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
