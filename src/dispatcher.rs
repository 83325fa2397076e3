//! The fetching half of the pipeline: runs the batch function and fans the
//! results back out to each key's slot.

use std::{
    any::Any,
    future::Future,
    hash::Hash,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crossbeam::channel::Receiver;
use futures::executor;
use tracing::{debug, warn};

use crate::{
    cache::{KeyCache, Request},
    error::LoadError,
    future::Promise,
};

pub(crate) struct Dispatcher<Key, Value, Error, Batcher> {
    pub(crate) batcher: Batcher,
    pub(crate) cache: Arc<KeyCache<Key, Value, Error>>,
    pub(crate) name: Arc<str>,
}

impl<Key, Value, Error, Batcher, Fut> Dispatcher<Key, Value, Error, Batcher>
where
    Key: Eq + Hash + Clone,
    Error: Clone,
    Batcher: Fn(Vec<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<Result<Value, Error>>, Error>>,
{
    /// Dispatch batches one at a time, in the order they're received, until
    /// the collector hangs up.
    pub(crate) fn run(&self, batches: Receiver<Vec<Request<Key, Value, Error>>>) {
        for batch in batches.iter() {
            self.dispatch(batch);
        }

        debug!(loader = %self.name, "batch channel closed; dispatcher finished");
    }

    /// Call the batch function exactly once for this batch, and resolve every
    /// key in it.
    pub(crate) fn dispatch(&self, batch: Vec<Request<Key, Value, Error>>) {
        let (keys, promises): (Vec<Key>, Vec<Promise<Value, Error>>) = batch.into_iter().unzip();
        let expected = keys.len();

        match self.fetch(keys.clone()) {
            Ok(values) if values.len() == expected => {
                debug!(loader = %self.name, size = expected, "batch fetched");

                // Per-key errors are ordinary results: they stay cached.
                promises
                    .into_iter()
                    .zip(values)
                    .for_each(|(promise, value)| promise.fulfill(value.map_err(LoadError::Rejected)));
            }
            Ok(values) => {
                let actual = values.len();
                warn!(loader = %self.name, expected, actual, "batch function returned the wrong number of values");
                self.fail(keys, promises, LoadError::LengthMismatch { expected, actual });
            }
            Err(err) => {
                warn!(loader = %self.name, size = expected, "batch failed");
                self.fail(keys, promises, err);
            }
        }
    }

    /// Run the batch function to completion on this thread. A panic, either
    /// while creating the future or while polling it, is caught and reported
    /// as a failure of this batch.
    fn fetch(&self, keys: Vec<Key>) -> Result<Vec<Result<Value, Error>>, LoadError<Error>> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            executor::block_on((self.batcher)(keys))
        }));

        match outcome {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(err)) => Err(LoadError::Batch(err)),
            Err(payload) => Err(LoadError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Resolve the whole batch with the same error. Keys are evicted before
    /// their slots are resolved, so a caller reacting to the error by
    /// loading again gets a fresh fetch rather than the failed slot.
    fn fail(&self, keys: Vec<Key>, promises: Vec<Promise<Value, Error>>, err: LoadError<Error>) {
        keys.iter().zip(promises).for_each(|(key, promise)| {
            self.cache.evict(key, &promise);
            promise.fulfill(Err(err.clone()));
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("batch function panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{cache::Registration, future::BatchFuture};
    use futures::future;

    type TestCache = KeyCache<u32, String, String>;
    type Fetched = future::Ready<Result<Vec<Result<String, String>>, String>>;

    fn request(cache: &TestCache, key: u32) -> (BatchFuture<String, String>, Request<u32, String, String>) {
        match cache.register(key) {
            Registration::Created(fut, request) => (fut, request),
            Registration::Cached(..) => panic!("key {} already cached", key),
        }
    }

    fn dispatcher<Batcher>(batcher: Batcher) -> Dispatcher<u32, String, String, Batcher> {
        Dispatcher {
            batcher,
            cache: Arc::new(KeyCache::new()),
            name: Arc::from("test"),
        }
    }

    #[test]
    fn values_are_matched_by_position() {
        let dispatcher = dispatcher(|keys: Vec<u32>| -> Fetched {
            future::ready(Ok(keys
                .into_iter()
                .map(|key| match key {
                    0 => Err("zero".to_string()),
                    key => Ok(key.to_string()),
                })
                .collect()))
        });

        let (fut0, req0) = request(&dispatcher.cache, 0);
        let (fut1, req1) = request(&dispatcher.cache, 1);
        dispatcher.dispatch(vec![req1, req0]);

        assert_eq!(fut1.try_get(), Some(&Ok("1".to_string())));
        assert_eq!(fut0.try_get(), Some(&Err(LoadError::Rejected("zero".to_string()))));

        // Both results stay cached
        assert_eq!(dispatcher.cache.len(), 2);
    }

    #[test]
    fn batch_error_evicts_every_key() {
        let dispatcher = dispatcher(|_keys: Vec<u32>| -> Fetched { future::ready(Err("down".to_string())) });

        let (fut0, req0) = request(&dispatcher.cache, 0);
        let (fut1, req1) = request(&dispatcher.cache, 1);
        dispatcher.dispatch(vec![req0, req1]);

        assert_eq!(fut0.wait(), Err(LoadError::Batch("down".to_string())));
        assert_eq!(fut1.wait(), Err(LoadError::Batch("down".to_string())));
        assert_eq!(dispatcher.cache.len(), 0);
    }

    #[test]
    fn length_mismatch_fails_the_batch() {
        let dispatcher = dispatcher(|_keys: Vec<u32>| -> Fetched {
            future::ready(Ok(vec![Ok("only".to_string())]))
        });

        let (fut0, req0) = request(&dispatcher.cache, 0);
        let (fut1, req1) = request(&dispatcher.cache, 1);
        dispatcher.dispatch(vec![req0, req1]);

        let expected = Err(LoadError::LengthMismatch {
            expected: 2,
            actual: 1,
        });
        assert_eq!(fut0.wait(), expected);
        assert_eq!(fut1.wait(), expected);
        assert_eq!(dispatcher.cache.len(), 0);
    }

    #[test]
    fn panic_fails_the_batch() {
        let dispatcher = dispatcher(|_keys: Vec<u32>| -> Fetched { panic!("boom") });

        let (fut, req) = request(&dispatcher.cache, 0);
        dispatcher.dispatch(vec![req]);

        assert_eq!(fut.wait(), Err(LoadError::Panicked("boom".to_string())));
        assert_eq!(dispatcher.cache.len(), 0);
    }

    #[test]
    fn failure_leaves_reregistered_keys_alone() {
        let dispatcher = dispatcher(|_keys: Vec<u32>| -> Fetched { future::ready(Err("down".to_string())) });

        let (old, req) = request(&dispatcher.cache, 0);
        dispatcher.cache.remove(&0);
        let (new, _new_req) = request(&dispatcher.cache, 0);

        dispatcher.dispatch(vec![req]);

        assert!(old.is_resolved());
        assert!(!new.is_resolved());
        assert_eq!(dispatcher.cache.len(), 1);
    }
}
