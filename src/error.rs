//! Error types for the loader façade and for individual key loads.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors returned synchronously by [`Loader`](crate::Loader) operations.
///
/// These are misuse or overload conditions; they never describe the outcome
/// of a fetch. A key whose `load` returned one of these was not registered.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The loader was stopped; no more keys can be enqueued.
    #[error("loader is closed")]
    Closed,

    /// The internal queue stayed full for the whole enqueue timeout.
    #[error("loader queue is full (capacity {capacity}, waited {waited:?})")]
    QueueFull { capacity: usize, waited: Duration },

    /// The background pipeline threads could not be started.
    #[error("failed to spawn loader pipeline thread")]
    Spawn(#[source] io::Error),
}

/// The failure side of a resolved [`BatchFuture`](crate::BatchFuture).
///
/// Only [`LoadError::Rejected`] is memoized by the cache. Every other variant
/// describes a failure of the whole batch, and the affected keys are evicted
/// so that a later `load` fetches them again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The fetch operation returned an error for this particular key.
    #[error("key rejected by fetch: {0}")]
    Rejected(E),

    /// The fetch operation failed for the whole batch.
    #[error("batch fetch failed: {0}")]
    Batch(E),

    /// The fetch operation returned the wrong number of values.
    #[error("fetch returned {actual} values for a batch of {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },

    /// The fetch operation panicked.
    #[error("fetch panicked: {0}")]
    Panicked(String),

    /// The key was dropped by the pipeline before it could be fetched.
    #[error("load was canceled before the key was fetched")]
    Canceled,
}

impl<E> LoadError<E> {
    /// True if this failure stays in the cache until it is cleared.
    #[inline]
    pub fn is_cached(&self) -> bool {
        matches!(self, LoadError::Rejected(..))
    }

    /// Get the error produced by the fetch operation, if there is one.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            LoadError::Rejected(err) | LoadError::Batch(err) => Some(err),
            _ => None,
        }
    }
}
