use std::{
    collections::hash_map::{Entry, HashMap},
    hash::Hash,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    error::LoadError,
    future::{BatchFuture, Promise, Slot},
};

/// A key waiting to be fetched, along with the promise for its slot.
pub(crate) type Request<Key, Value, Error> = (Key, Promise<Value, Error>);

/// Outcome of registering interest in a key.
pub(crate) enum Registration<Key, Value, Error> {
    /// The key already had a slot; nothing needs to be fetched.
    Cached(BatchFuture<Value, Error>),

    /// A fresh slot was created. The caller is responsible for handing the
    /// request to the pipeline.
    Created(BatchFuture<Value, Error>, Request<Key, Value, Error>),
}

/// Maps each key to the slot holding its (eventual) result. There is at
/// most one slot per key; a slot stays cached after it resolves, until it is
/// cleared or its batch fails.
pub(crate) struct KeyCache<Key, Value, Error> {
    entries: Mutex<HashMap<Key, Arc<Slot<Value, Error>>>>,
}

impl<Key: Eq + Hash + Clone, Value, Error> KeyCache<Key, Value, Error> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the slot for a key, creating it if it doesn't exist. The lookup
    /// and insertion happen under a single lock, so concurrent registrations
    /// of the same key produce exactly one `Created`.
    pub(crate) fn register(&self, key: Key) -> Registration<Key, Value, Error> {
        match self.entries.lock().entry(key) {
            Entry::Occupied(entry) => Registration::Cached(BatchFuture::new(entry.get().clone())),
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                let slot = Arc::new(Slot::new());
                entry.insert(slot.clone());
                Registration::Created(BatchFuture::new(slot.clone()), (key, Promise::new(slot)))
            }
        }
    }

    /// Insert an already-resolved slot, unless the key is already present.
    /// Returns true if the result was inserted.
    pub(crate) fn prime(&self, key: Key, result: Result<Value, LoadError<Error>>) -> bool {
        match self.entries.lock().entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Slot::resolved(result)));
                true
            }
        }
    }

    pub(crate) fn remove(&self, key: &Key) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove a key only if it's still mapped to the slot that `promise`
    /// writes to. A key that was cleared and registered again while its old
    /// batch was in flight keeps its new slot.
    pub(crate) fn evict(&self, key: &Key, promise: &Promise<Value, Error>) -> bool {
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(slot) if promise.writes_to(slot) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
