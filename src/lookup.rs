//! Iterative lookup: the round-based search at the heart of Kademlia.
//!
//! One algorithm serves both peer discovery and value retrieval:
//!
//! 1. Seed the shortlist with the α contacts closest to the target that the
//!    routing table knows.
//! 2. Each round, query up to α contacts that have not been queried yet, all
//!    at once, and fold every response into the shortlist as it arrives.
//! 3. A round that leaves the shortlist's set of ids unchanged means the search
//!    converged: query whatever is still unqueried in the shortlist once, α at
//!    a time, fold that in, and stop. A round in which every request failed, or
//!    one that changed the shortlist, moves on to the next candidates. Running
//!    out of candidates ends the search.
//!
//! The driver waits for all requests of a batch before sending the next one,
//! the final pass included, so at most α requests per lookup are ever
//! outstanding. The lookup state is owned by the driver; concurrent lookups
//! share nothing but the routing table.

use std::collections::HashSet;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::error::Result;
use crate::id::NodeId;
use crate::net::{DhtNetwork, FindValueReply};
use crate::node::DhtNode;
use crate::routing::{sort_by_distance, Contact};

/// What a lookup is searching for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    /// The contacts closest to the target (FIND_NODE).
    FindContact,
    /// The value stored at the target key (FIND_DATA).
    FindValue,
}

/// How a lookup ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// A round found nothing closer; the final pass has run.
    Converged,
    /// A peer returned the value.
    ValueFound,
    /// Every candidate has been queried.
    Exhausted,
}

/// Result of a lookup.
#[derive(Clone, Debug)]
pub struct LookupOutcome {
    /// Closest responsive contacts found, nearest first.
    pub contacts: Vec<Contact>,
    /// The value, for a successful [`LookupKind::FindValue`] lookup.
    pub value: Option<String>,
    pub termination: Termination,
}

/// Per-lookup working set.
#[derive(Debug)]
pub struct LookupState {
    target: NodeId,
    self_id: NodeId,
    width: usize,
    shortlist: Vec<Contact>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
}

impl LookupState {
    pub fn new(target: NodeId, self_id: NodeId, width: usize, seed: Vec<Contact>) -> Self {
        let mut state = Self {
            target,
            self_id,
            width,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
        };
        state.merge(seed);
        state
    }

    /// Take up to `alpha` unqueried contacts, nearest first, marking them queried.
    pub fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let batch: Vec<Contact> = self
            .shortlist
            .iter()
            .filter(|c| !self.queried.contains(&c.id))
            .take(alpha)
            .cloned()
            .collect();
        for contact in &batch {
            self.queried.insert(contact.id);
        }
        batch
    }

    /// Every unqueried contact in the shortlist, marking them queried.
    pub fn drain_unqueried(&mut self) -> Vec<Contact> {
        self.next_batch(usize::MAX)
    }

    /// Fold contacts into the shortlist.
    ///
    /// Duplicates, our own id and contacts that failed to answer are skipped.
    /// The shortlist is re-sorted by distance and cut to the retrieval width.
    pub fn merge(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            if contact.id == self.self_id || self.failed.contains(&contact.id) {
                continue;
            }
            if self.shortlist.iter().any(|c| c.id == contact.id) {
                continue;
            }
            self.shortlist.push(contact);
        }
        sort_by_distance(&mut self.shortlist, &self.target);
        self.shortlist.truncate(self.width);
    }

    /// Drop a contact that failed to answer.
    pub fn mark_failed(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.shortlist.retain(|c| &c.id != id);
    }

    /// Ids currently in the shortlist.
    pub fn ids(&self) -> HashSet<NodeId> {
        self.shortlist.iter().map(|c| c.id).collect()
    }

    pub fn shortlist(&self) -> &[Contact] {
        &self.shortlist
    }

    fn into_outcome(self, termination: Termination) -> LookupOutcome {
        LookupOutcome {
            contacts: self.shortlist,
            value: None,
            termination,
        }
    }
}

/// Response of one query, tagged with the contact it came from.
enum QueryReply {
    Contacts(Vec<Contact>),
    Value(String),
}

/// What folding a batch of replies produced.
struct RoundReport {
    failures: usize,
    value: Option<String>,
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Run an iterative lookup toward `target`.
    ///
    /// Transport failures are absorbed: a peer that does not answer is dropped
    /// from the shortlist and counts toward its round's failures.
    pub async fn lookup(&self, kind: LookupKind, target: NodeId) -> LookupOutcome {
        let alpha = self.params.alpha;
        let seed = self.closest_contacts(&target, alpha).await;
        let mut state = LookupState::new(target, self.id(), self.params.retrieval_width, seed);

        loop {
            let batch = state.next_batch(alpha);
            if batch.is_empty() {
                debug!(target = %target, ?kind, "lookup exhausted its candidates");
                return state.into_outcome(Termination::Exhausted);
            }

            let before = state.ids();
            let asked = batch.len();
            let report = self.run_round(kind, target, batch, &mut state).await;
            if let Some(value) = report.value {
                return found(state, value);
            }
            if report.failures == asked {
                trace!(target = %target, "every request of the round failed");
                continue;
            }

            if state.ids() == before {
                // Final pass over a snapshot: contacts it discovers are folded
                // in but not queried.
                let mut rest = state.drain_unqueried();
                while !rest.is_empty() {
                    let take = rest.len().min(alpha);
                    let batch: Vec<Contact> = rest.drain(..take).collect();
                    let report = self.run_round(kind, target, batch, &mut state).await;
                    if let Some(value) = report.value {
                        return found(state, value);
                    }
                }
                return state.into_outcome(Termination::Converged);
            }
        }
    }

    /// Query `batch` concurrently and fold replies in as they arrive.
    ///
    /// Returns early when a value is found; the remaining requests of the
    /// round are dropped and their replies ignored.
    async fn run_round(
        &self,
        kind: LookupKind,
        target: NodeId,
        batch: Vec<Contact>,
        state: &mut LookupState,
    ) -> RoundReport {
        let mut in_flight: FuturesUnordered<_> = batch
            .into_iter()
            .map(|contact| async move {
                let reply = self.query(kind, &contact, target).await;
                (contact, reply)
            })
            .collect();

        let mut report = RoundReport {
            failures: 0,
            value: None,
        };
        while let Some((contact, reply)) = in_flight.next().await {
            match reply {
                Ok(QueryReply::Value(value)) => {
                    self.observe_contact(contact).await;
                    report.value = Some(value);
                    return report;
                }
                Ok(QueryReply::Contacts(contacts)) => {
                    self.observe_contact(contact).await;
                    state.merge(contacts);
                }
                Err(err) => {
                    report.failures += 1;
                    state.mark_failed(&contact.id);
                    self.events.log(format!(
                        "{kind:?} request to {} ({}) failed: {err}",
                        contact.id, contact.address
                    ));
                }
            }
        }
        report
    }

    async fn query(&self, kind: LookupKind, contact: &Contact, target: NodeId) -> Result<QueryReply> {
        match kind {
            LookupKind::FindContact => self
                .network
                .find_node(contact, target)
                .await
                .map(QueryReply::Contacts),
            LookupKind::FindValue => {
                match self.network.find_value(contact, target.into()).await? {
                    FindValueReply::Value(value) => Ok(QueryReply::Value(value)),
                    FindValueReply::Contacts(contacts) => Ok(QueryReply::Contacts(contacts)),
                }
            }
        }
    }
}

fn found(state: LookupState, value: String) -> LookupOutcome {
    let mut outcome = state.into_outcome(Termination::ValueFound);
    outcome.value = Some(value);
    outcome
}
