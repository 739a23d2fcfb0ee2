//! Local key/value storage with per-key expiration.
//!
//! Every key owns a slot guarded by its own lock, so operations on different
//! keys never contend. The table mapping keys to slots has a separate lock that
//! is only held long enough to look up or create a slot.
//!
//! Expiry is driven by one timer task per key. When the timer fires it re-reads
//! the entry's current deadline, which reads and refreshes may have pushed
//! forward, and either deletes the entry or sleeps for the remaining time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

use crate::error::{DhtError, Result};
use crate::events::EventSink;
use crate::id::Key;

/// A stored value and the instant it stops being served.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Per-key state. `retired` is set once the slot has been unlinked from the
/// table; holders of a stale handle must look the key up again.
#[derive(Debug, Default)]
struct Slot {
    entry: Option<Entry>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    retired: bool,
}

type SlotHandle = Arc<Mutex<Slot>>;

struct Shared {
    slots: Mutex<HashMap<Key, SlotHandle>>,
    ttl: Duration,
    events: Arc<dyn EventSink>,
}

/// Concurrent key/value store whose entries expire `ttl` after their last
/// insert or read.
#[derive(Clone)]
pub struct DataStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("ttl", &self.shared.ttl)
            .finish()
    }
}

impl DataStore {
    pub fn new(ttl: Duration, events: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                ttl,
                events,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Insert or overwrite a value, resetting its deadline to `now + ttl`.
    pub async fn insert(&self, key: Key, value: String) {
        loop {
            let handle = self.slot_or_create(key).await;
            let mut slot = handle.lock().await;
            if slot.retired {
                continue;
            }
            slot.entry = Some(Entry {
                value,
                expires_at: Instant::now() + self.shared.ttl,
            });
            let timer_alive = slot.timer.as_ref().is_some_and(|t| !t.is_finished());
            if !timer_alive {
                slot.generation += 1;
                let generation = slot.generation;
                slot.timer = Some(tokio::spawn(expire_when_due(
                    self.shared.clone(),
                    key,
                    handle.clone(),
                    generation,
                )));
            }
            return;
        }
    }

    /// Read a value and push its deadline to `now + ttl`.
    pub async fn get(&self, key: &Key) -> Result<String> {
        let handle = self.slot(key).await.ok_or(DhtError::NotFound)?;
        let mut slot = handle.lock().await;
        let now = Instant::now();
        match slot.entry.as_mut() {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.shared.ttl;
                Ok(entry.value.clone())
            }
            _ => Err(DhtError::NotFound),
        }
    }

    /// Push a value's deadline to `now + ttl` without reading it.
    pub async fn refresh_expiration_time(&self, key: &Key) -> Result<()> {
        let handle = self.slot(key).await.ok_or(DhtError::NotFound)?;
        let mut slot = handle.lock().await;
        let now = Instant::now();
        match slot.entry.as_mut() {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.shared.ttl;
                Ok(())
            }
            _ => Err(DhtError::NotFound),
        }
    }

    /// Current deadline of a key.
    pub async fn expires_at(&self, key: &Key) -> Result<Instant> {
        let handle = self.slot(key).await.ok_or(DhtError::NotFound)?;
        let slot = handle.lock().await;
        slot.entry
            .as_ref()
            .map(|e| e.expires_at)
            .ok_or(DhtError::NotFound)
    }

    /// Remove a key immediately and cancel its expiry timer.
    pub async fn forget(&self, key: &Key) -> Result<()> {
        let handle = self.slot(key).await.ok_or(DhtError::NotFound)?;
        let mut slot = handle.lock().await;
        if slot.retired || slot.entry.is_none() {
            return Err(DhtError::NotFound);
        }
        slot.entry = None;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.generation += 1;
        unlink(&self.shared, key, &handle, &mut slot).await;
        Ok(())
    }

    /// Number of keys currently holding a value.
    pub async fn len(&self) -> usize {
        let handles: Vec<SlotHandle> = {
            let slots = self.shared.slots.lock().await;
            slots.values().cloned().collect()
        };
        let mut count = 0;
        for handle in handles {
            if handle.lock().await.entry.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, key: &Key) -> Option<SlotHandle> {
        let slots = self.shared.slots.lock().await;
        slots.get(key).cloned()
    }

    async fn slot_or_create(&self, key: Key) -> SlotHandle {
        let mut slots = self.shared.slots.lock().await;
        slots.entry(key).or_default().clone()
    }
}

/// Retire a slot and drop it from the table if the table still points at it.
///
/// Called with the slot lock held. The table lock is never held while waiting
/// for a slot lock, so taking it here cannot deadlock.
async fn unlink(shared: &Shared, key: &Key, handle: &SlotHandle, slot: &mut Slot) {
    slot.retired = true;
    let mut slots = shared.slots.lock().await;
    if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, handle)) {
        slots.remove(key);
    }
}

/// Timer task of one key: sleep until the deadline, then delete or reschedule.
async fn expire_when_due(shared: Arc<Shared>, key: Key, handle: SlotHandle, generation: u64) {
    let mut deadline = Instant::now() + shared.ttl;
    loop {
        sleep_until(deadline).await;

        let mut slot = handle.lock().await;
        if slot.generation != generation || slot.retired {
            return;
        }
        let Some(entry) = slot.entry.as_ref() else {
            return;
        };
        if entry.expires_at > Instant::now() {
            deadline = entry.expires_at;
            debug!(key = %key, "entry refreshed, rescheduling expiry");
            continue;
        }

        let value = slot.entry.take().map(|e| e.value).unwrap_or_default();
        slot.timer = None;
        unlink(&shared, &key, &handle, &mut slot).await;
        drop(slot);
        shared.events.log(format!(
            "The data object {key} with the value {value} has been deleted due to the expired TTL."
        ));
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::id::hash_content;
    use tokio::time::sleep;

    fn store_with_ttl(ttl: Duration) -> (DataStore, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (DataStore::new(ttl, sink.clone()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn insert_then_get_returns_value() {
        let (store, _) = store_with_ttl(Duration::from_secs(10));
        let key = hash_content(b"hello");
        store.insert(key, "hello".into()).await;
        assert_eq!(store.get(&key).await.expect("present"), "hello");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let (store, sink) = store_with_ttl(Duration::from_secs(1));
        let key = hash_content(b"short lived");
        store.insert(key, "short lived".into()).await;

        sleep(Duration::from_millis(1100)).await;
        assert!(matches!(store.get(&key).await, Err(DhtError::NotFound)));
        assert!(store.is_empty().await);
        assert!(sink.all().iter().any(|line| line.contains(&key.to_hex())));
    }

    #[tokio::test(start_paused = true)]
    async fn get_extends_life_by_a_full_ttl() {
        let ttl = Duration::from_secs(2);
        let (store, _) = store_with_ttl(ttl);
        let key = hash_content(b"refresh me");
        store.insert(key, "refresh me".into()).await;

        sleep(ttl / 2).await;
        store.get(&key).await.expect("still fresh at T/2");
        sleep(ttl / 2).await;
        assert_eq!(store.get(&key).await.expect("alive at T"), "refresh me");

        sleep(ttl + Duration::from_millis(100)).await;
        assert!(matches!(store.get(&key).await, Err(DhtError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_expiration_time_extends_deadline() {
        let ttl = Duration::from_secs(2);
        let (store, _) = store_with_ttl(ttl);
        let key = hash_content(b"v");
        store.insert(key, "v".into()).await;
        let first = store.expires_at(&key).await.expect("present");

        sleep(Duration::from_secs(1)).await;
        store.refresh_expiration_time(&key).await.expect("present");
        let second = store.expires_at(&key).await.expect("present");
        assert_eq!(second - first, Duration::from_secs(1));

        let missing = hash_content(b"missing");
        assert!(matches!(
            store.refresh_expiration_time(&missing).await,
            Err(DhtError::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_prevents_resurrection() {
        let (store, sink) = store_with_ttl(Duration::from_secs(1));
        let key = hash_content(b"gone");
        store.insert(key, "gone".into()).await;
        store.forget(&key).await.expect("present");

        sleep(Duration::from_secs(2)).await;
        assert!(matches!(store.get(&key).await, Err(DhtError::NotFound)));
        assert!(matches!(store.forget(&key).await, Err(DhtError::NotFound)));
        assert!(store.is_empty().await);
        assert!(sink.all().is_empty(), "forgotten keys are not reported as expired");
    }

    #[tokio::test(start_paused = true)]
    async fn reinsert_after_forget_gets_a_fresh_timer() {
        let (store, _) = store_with_ttl(Duration::from_secs(1));
        let key = hash_content(b"again");
        store.insert(key, "again".into()).await;

        sleep(Duration::from_millis(500)).await;
        store.forget(&key).await.expect("present");
        store.insert(key, "again".into()).await;

        sleep(Duration::from_millis(700)).await;
        assert_eq!(store.get(&key).await.expect("new entry alive"), "again");
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_resets_deadline() {
        let (store, _) = store_with_ttl(Duration::from_secs(1));
        let key = hash_content(b"first");
        store.insert(key, "first".into()).await;
        sleep(Duration::from_millis(800)).await;
        store.insert(key, "second".into()).await;
        sleep(Duration::from_millis(800)).await;
        assert_eq!(store.get(&key).await.expect("alive"), "second");
    }
}
