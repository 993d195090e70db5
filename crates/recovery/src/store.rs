//! Observable keyed snapshot store.
//!
//! Every mutation builds a new map and replaces the published snapshot as a
//! whole, so readers never see a half-applied update. Subscribers get a
//! `watch` receiver whose first value is the current snapshot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;

/// Immutable map snapshot shared with observers.
pub type Snapshot<K, V> = Arc<HashMap<K, V>>;

/// Mutex-guarded map published through a `watch` channel.
pub struct ObservableStore<K, V> {
    current: Mutex<Snapshot<K, V>>,
    publisher: watch::Sender<Snapshot<K, V>>,
}

impl<K, V> ObservableStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        let initial: Snapshot<K, V> = Arc::new(HashMap::new());
        let (publisher, _) = watch::channel(Arc::clone(&initial));
        Self {
            current: Mutex::new(initial),
            publisher,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Snapshot<K, V> {
        Arc::clone(&self.current.lock())
    }

    /// Clone of one entry.
    pub fn get(&self, key: &K) -> Option<V> {
        self.current.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.current.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.current.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.lock().is_empty()
    }

    /// Receiver that sees the current snapshot first, then every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot<K, V>> {
        self.publisher.subscribe()
    }

    /// Apply `f` to a copy of the map and publish the copy.
    ///
    /// The closure runs under the store lock, so check-and-set sequences
    /// inside it are atomic with respect to other updates.
    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let mut current = self.current.lock();
        let mut next = HashMap::clone(&current);
        let result = f(&mut next);
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        self.publisher.send_replace(next);
        result
    }

    /// Insert or replace one entry, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|map| map.insert(key, value))
    }

    /// Remove one entry. Publishes only when something was removed.
    pub fn remove(&self, key: &K) -> Option<V> {
        if !self.contains(key) {
            return None;
        }
        self.update(|map| map.remove(key))
    }

    /// Replace an existing entry through `f`; no-op when the key is absent.
    pub fn modify<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.update(|map| map.get_mut(key).map(f))
    }
}

impl<K, V> Default for ObservableStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
