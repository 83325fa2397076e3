//! The write-once result container shared between the dispatcher and every
//! caller waiting on a key.
//!
//! A [`Slot`] is created empty when a key is registered. The pipeline owns
//! the only [`Promise`] for it and resolves it exactly once; callers hold
//! [`BatchFuture`] handles, which can either block a thread with
//! [`BatchFuture::wait`] or be `.await`ed from any executor.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
    error::LoadError,
    wakerset::{Token as WakerToken, WakerSet},
};

pub(crate) type LoadResult<Value, Error> = Result<Value, LoadError<Error>>;

pub(crate) struct Slot<Value, Error> {
    result: OnceCell<LoadResult<Value, Error>>,

    // Becomes None when the slot is resolved and its wakers are drained. The
    // result is always set before this is taken, so a poller that finds None
    // here is guaranteed to find a result.
    wakers: Mutex<Option<WakerSet>>,
}

impl<Value, Error> Slot<Value, Error> {
    pub(crate) fn new() -> Self {
        Self {
            result: OnceCell::new(),
            wakers: Mutex::new(Some(WakerSet::default())),
        }
    }

    /// Create a slot that is already resolved, for primed keys.
    pub(crate) fn resolved(result: LoadResult<Value, Error>) -> Self {
        Self {
            result: OnceCell::from(result),
            wakers: Mutex::new(None),
        }
    }

    /// Store the result and wake every waiting task. Blocked threads are
    /// released by the cell itself. Returns false if the slot was already
    /// resolved, in which case `result` is discarded.
    fn resolve(&self, result: LoadResult<Value, Error>) -> bool {
        if self.result.set(result).is_err() {
            return false;
        }

        // Take the wakers out before waking them so that no task is woken
        // while we're holding the lock.
        let wakers = self.wakers.lock().take();
        if let Some(wakers) = wakers {
            wakers.wake_all();
        }

        true
    }

    #[inline]
    fn get(&self) -> Option<&LoadResult<Value, Error>> {
        self.result.get()
    }
}

/// The writing half of a slot. Exactly one exists per registered key, and it
/// travels with the key through the queue, the collector and the dispatcher.
///
/// If a promise is dropped without being fulfilled, its slot is resolved with
/// [`LoadError::Canceled`], so that no reader ever waits on a slot nobody
/// will write.
pub(crate) struct Promise<Value, Error> {
    slot: Option<Arc<Slot<Value, Error>>>,
}

impl<Value, Error> Promise<Value, Error> {
    pub(crate) fn new(slot: Arc<Slot<Value, Error>>) -> Self {
        Self { slot: Some(slot) }
    }

    /// Check if this promise writes to the given slot.
    pub(crate) fn writes_to(&self, slot: &Arc<Slot<Value, Error>>) -> bool {
        self.slot
            .as_ref()
            .map_or(false, |own| Arc::ptr_eq(own, slot))
    }

    pub(crate) fn fulfill(mut self, result: LoadResult<Value, Error>) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(result);
        }
    }
}

impl<Value, Error> Drop for Promise<Value, Error> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(Err(LoadError::Canceled));
        }
    }
}

impl<Value, Error> Debug for Promise<Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.slot.is_none())
            .finish()
    }
}

/// A handle to the eventual result of loading a single key.
///
/// Every caller that loads the same key (until it is cleared from the cache)
/// gets a handle to the same underlying slot. Handles are cheap to clone, and
/// all clones observe the same result. The result can be read by blocking the
/// current thread with [`wait`](BatchFuture::wait), or by awaiting the handle
/// as a future; both are driven by the loader's background pipeline, so a
/// `BatchFuture` never needs to be polled for its batch to make progress.
pub struct BatchFuture<Value, Error> {
    slot: Arc<Slot<Value, Error>>,
    waker_token: Option<WakerToken>,
}

impl<Value, Error> BatchFuture<Value, Error> {
    pub(crate) fn new(slot: Arc<Slot<Value, Error>>) -> Self {
        Self {
            slot,
            waker_token: None,
        }
    }

    /// Get the result if the key has already been resolved. Never blocks.
    #[inline]
    pub fn try_get(&self) -> Option<&Result<Value, LoadError<Error>>> {
        self.slot.get()
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Block the current thread until the key is resolved, then return a
    /// reference to the result.
    pub fn wait_ref(&self) -> &Result<Value, LoadError<Error>> {
        self.slot.result.wait()
    }

    /// Check if two handles refer to the same cached load.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Poll for the result without cloning it. Registers the task's waker if
    /// the slot isn't resolved yet.
    fn poll_ref(&mut self, ctx: &mut Context<'_>) -> Poll<&LoadResult<Value, Error>> {
        if self.slot.get().is_none() {
            if let Some(ref mut wakers) = *self.slot.wakers.lock() {
                match self.waker_token.as_ref() {
                    Some(token) => wakers.replace_waker(token, ctx.waker()),
                    None => self.waker_token = Some(wakers.add_waker(ctx.waker().clone())),
                }
            }
        }

        // Check again: the slot may have been resolved between the first
        // check and the waker registration.
        match self.slot.get() {
            None => Poll::Pending,
            Some(result) => {
                // The wakers were drained by resolve; the token is stale.
                self.waker_token = None;
                Poll::Ready(result)
            }
        }
    }
}

impl<Value: Clone, Error: Clone> BatchFuture<Value, Error> {
    /// Block the current thread until the key is resolved, then return a
    /// copy of the result.
    pub fn wait(&self) -> Result<Value, LoadError<Error>> {
        self.wait_ref().clone()
    }
}

impl<Value, Error> Clone for BatchFuture<Value, Error> {
    fn clone(&self) -> Self {
        // Each handle registers its own waker, so the token isn't shared.
        Self::new(self.slot.clone())
    }
}

impl<Value: Debug, Error: Debug> Debug for BatchFuture<Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFuture")
            .field("result", &self.slot.get())
            .field("waker_token", &self.waker_token)
            .finish()
    }
}

impl<Value: Clone, Error: Clone> Future for BatchFuture<Value, Error> {
    type Output = Result<Value, LoadError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::into_inner(self).poll_ref(ctx).map(Clone::clone)
    }
}

impl<Value, Error> Drop for BatchFuture<Value, Error> {
    fn drop(&mut self) {
        // Deregister our waker so the slot doesn't keep waking a task that
        // lost interest.
        if let Some(token) = self.waker_token.take() {
            if let Some(ref mut wakers) = *self.slot.wakers.lock() {
                wakers.discard_waker(token);
            }
        }
    }
}

/// The result of [`Loader::load_many`](crate::Loader::load_many): a handle
/// to the results of several keys, which resolves to their values in the
/// order the keys were given.
pub struct LoadMany<Value, Error> {
    futures: Vec<BatchFuture<Value, Error>>,
}

impl<Value, Error> LoadMany<Value, Error> {
    pub(crate) fn new(futures: Vec<BatchFuture<Value, Error>>) -> Self {
        Self { futures }
    }

    /// The individual handles, in the order their keys were given.
    #[inline]
    pub fn futures(&self) -> &[BatchFuture<Value, Error>] {
        &self.futures
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.futures.iter().all(BatchFuture::is_resolved)
    }

    #[inline]
    pub fn into_futures(self) -> Vec<BatchFuture<Value, Error>> {
        self.futures
    }
}

impl<Value: Clone, Error: Clone> LoadMany<Value, Error> {
    /// Block the current thread until every key is resolved.
    pub fn wait(&self) -> Vec<Result<Value, LoadError<Error>>> {
        self.futures.iter().map(BatchFuture::wait).collect()
    }
}

impl<Value: Debug, Error: Debug> Debug for LoadMany<Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.futures.iter()).finish()
    }
}

impl<Value: Clone, Error: Clone> Future for LoadMany<Value, Error> {
    type Output = Vec<Result<Value, LoadError<Error>>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        // Poll every handle, not just the first pending one, so that each
        // slot has our waker registered.
        let mut pending = false;
        for fut in unpinned.futures.iter_mut() {
            if fut.poll_ref(ctx).is_pending() {
                pending = true;
            }
        }

        if pending {
            return Poll::Pending;
        }

        Poll::Ready(
            unpinned
                .futures
                .iter()
                .filter_map(BatchFuture::try_get)
                .cloned()
                .collect(),
        )
    }
}
