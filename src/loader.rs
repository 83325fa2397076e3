use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use crossbeam::channel::{self, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    cache::{KeyCache, Registration, Request},
    collector::Collector,
    config::LoaderConfig,
    dispatcher::Dispatcher,
    error::{LoadError, LoaderError},
    future::{BatchFuture, LoadMany},
};

/// A `Loader` coordinates batching and caching for a single batch function.
/// It can be shared by reference (or in an `Arc`) between any number of
/// threads, all of which can [`load`](Loader::load) individual keys.
///
/// Each loader owns a background pipeline of two threads: a collector, which
/// groups newly requested keys into batches, and a dispatcher, which calls
/// the batch function once per batch and resolves every key in it. Batches
/// are dispatched one at a time, in the order they were formed.
///
/// Results are cached per key for the lifetime of the loader, or until they
/// are [cleared](Loader::clear). The pipeline is shut down by
/// [`stop`](Loader::stop), or when the loader is dropped.
pub struct Loader<Key, Value, Error> {
    // None once the loader is stopped. Dropping the last sender closes the
    // queue, which lets the collector flush its final batch and exit.
    sender: ArcSwapOption<Sender<Request<Key, Value, Error>>>,
    cache: Arc<KeyCache<Key, Value, Error>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    capacity: usize,
    enqueue_timeout: Duration,
    name: Arc<str>,
}

impl<Key, Value, Error> Loader<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Send + Sync + 'static,
    Error: Clone + Send + Sync + 'static,
{
    /// Start a loader and its background pipeline.
    ///
    /// The batch function receives the keys of one batch, in the order they
    /// were first requested, and must return one result per key, in the same
    /// order. An `Err` element is a failure of that key only, and is cached
    /// like any other result; an `Err` for the whole call fails every key of
    /// the batch, and none of them are cached.
    pub fn start<Batcher, Fut>(batcher: Batcher, config: LoaderConfig) -> Result<Self, LoaderError>
    where
        Batcher: Fn(Vec<Key>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<Result<Value, Error>>, Error>>,
    {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let cache = Arc::new(KeyCache::new());

        let (key_tx, key_rx) = channel::bounded(config.buffer_size.get());

        // A single slot: the collector keeps accumulating the next batch while
        // the dispatcher is busy, but never gets more than one batch ahead.
        let (batch_tx, batch_rx) = channel::bounded(1);

        let collector = Collector {
            max_batch_size: config.max_batch_size,
            window: config.max_batch_time,
            name: name.clone(),
        };

        let dispatcher = Dispatcher {
            batcher,
            cache: cache.clone(),
            name: name.clone(),
        };

        let dispatch_handle = thread::Builder::new()
            .name(format!("{}-dispatch", name))
            .spawn(move || dispatcher.run(batch_rx))
            .map_err(LoaderError::Spawn)?;

        // If this fails, batch_tx is dropped with the closure, and the
        // dispatcher thread exits on its own.
        let collect_handle = thread::Builder::new()
            .name(format!("{}-collect", name))
            .spawn(move || collector.run(key_rx, batch_tx))
            .map_err(LoaderError::Spawn)?;

        debug!(
            loader = %name,
            max_batch_size = ?config.max_batch_size,
            max_batch_time = ?config.max_batch_time,
            buffer_size = config.buffer_size.get(),
            "loader started"
        );

        Ok(Self {
            sender: ArcSwapOption::from_pointee(key_tx),
            cache,
            worker_ids: vec![collect_handle.thread().id(), dispatch_handle.thread().id()],
            workers: Mutex::new(vec![collect_handle, dispatch_handle]),
            capacity: config.buffer_size.get(),
            enqueue_timeout: config.enqueue_timeout,
            name,
        })
    }

    /// Load a single key. If the key is already cached (resolved or not), the
    /// existing handle is returned and nothing new is fetched. Otherwise the
    /// key is registered and queued for the next batch.
    ///
    /// This only blocks if the queue is full, and then for at most the
    /// configured `enqueue_timeout`.
    pub fn load(&self, key: Key) -> Result<BatchFuture<Value, Error>, LoaderError> {
        let sender = self.sender.load_full().ok_or(LoaderError::Closed)?;

        match self.cache.register(key) {
            Registration::Cached(fut) => {
                trace!(loader = %self.name, "cache hit");
                Ok(fut)
            }
            Registration::Created(fut, request) => {
                self.enqueue(&sender, request)?;
                Ok(fut)
            }
        }
    }

    /// Load several keys. The returned [`LoadMany`] resolves to the results
    /// in the same order as `keys`. Duplicate keys share a single fetch.
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> Result<LoadMany<Value, Error>, LoaderError> {
        keys.into_iter()
            .map(|key| self.load(key))
            .collect::<Result<Vec<_>, _>>()
            .map(LoadMany::new)
    }

    fn enqueue(
        &self,
        sender: &Sender<Request<Key, Value, Error>>,
        request: Request<Key, Value, Error>,
    ) -> Result<(), LoaderError> {
        // Whatever happens, the promise is dropped only after the key is
        // evicted, so that nobody can observe the canceled slot in the cache.
        match sender.send_timeout(request, self.enqueue_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout((key, promise))) => {
                self.cache.evict(&key, &promise);
                drop(promise);

                warn!(loader = %self.name, capacity = self.capacity, "queue full; rejecting key");
                Err(LoaderError::QueueFull {
                    capacity: self.capacity,
                    waited: self.enqueue_timeout,
                })
            }
            Err(SendTimeoutError::Disconnected((key, promise))) => {
                self.cache.evict(&key, &promise);
                drop(promise);

                warn!(loader = %self.name, "pipeline is gone; rejecting key");
                Err(LoaderError::Closed)
            }
        }
    }

    /// Remove a key from the cache. If the key is part of a batch that's
    /// already queued or running, that batch still resolves its handles, but
    /// the next `load` of the key starts a fresh fetch.
    pub fn clear(&self, key: &Key) -> &Self {
        if self.cache.remove(key) {
            trace!(loader = %self.name, "cleared key");
        }

        self
    }

    /// Remove every key from the cache.
    pub fn clear_all(&self) -> &Self {
        self.cache.clear();
        self
    }

    /// Cache a value for a key without fetching it. Does nothing if the key
    /// is already cached.
    pub fn prime(&self, key: Key, value: Value) -> &Self {
        self.cache.prime(key, Ok(value));
        self
    }

    /// Cache a per-key failure without fetching it, as if the batch function
    /// had returned `Err(error)` for this key. Does nothing if the key is
    /// already cached.
    pub fn prime_error(&self, key: Key, error: Error) -> &Self {
        self.cache.prime(key, Err(LoadError::Rejected(error)));
        self
    }

    /// Number of keys currently cached, including keys still being fetched.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl<Key, Value, Error> Loader<Key, Value, Error> {
    /// Stop the loader. The queue is closed; keys that are already queued are
    /// still batched and fetched, and this method waits for that to finish.
    /// Concurrent callers all wait for the same drain. Calling `stop` more
    /// than once does nothing.
    ///
    /// After this, `load` and `load_many` return [`LoaderError::Closed`].
    pub fn stop(&self) {
        if self.sender.swap(None).is_some() {
            debug!(loader = %self.name, "stopping loader");
        }

        // Called from the batch function itself. Joining would deadlock, so
        // let the pipeline wind down on its own.
        if self.worker_ids.contains(&thread::current().id()) {
            return;
        }

        // The lock is held through the joins, so a concurrent caller returns
        // only after the pipeline has drained.
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                warn!(loader = %self.name, "pipeline thread panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.load().is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Key, Value, Error> Debug for Loader<Key, Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("capacity", &self.capacity)
            .field("enqueue_timeout", &self.enqueue_timeout)
            .finish()
    }
}

impl<Key, Value, Error> Drop for Loader<Key, Value, Error> {
    fn drop(&mut self) {
        self.stop();
    }
}
