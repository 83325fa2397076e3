//! Batchcache is a threaded Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It batches many independent single-key requests into
//! calls to one bulk lookup function, distributes the results back to each
//! requester, and caches every result per key, without the requesters
//! knowing anything about the batching.
//!
//! ## Overview
//!
//! Suppose you had an API to fetch user data by username. The API supports
//! batching: you can supply many usernames in one request, and it returns
//! one result per username, in the same order. Adapted to batchcache, that
//! batch function looks like this:
//!
//! ```
//! #[derive(Debug, Clone)]
//! struct UserData {
//!     username: String,
//!     age: u16,
//! }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum ApiError {
//!     NoSuchUser,
//!     Unavailable,
//! }
//!
//! async fn get_users(usernames: Vec<String>) ->
//!     Result<Vec<Result<UserData, ApiError>>, ApiError>
//! {
//!     Ok(usernames
//!         .into_iter()
//!         .map(|username| match username.as_str() {
//!             "nobody" => Err(ApiError::NoSuchUser),
//!             _ => Ok(UserData { username, age: 30 }),
//!         })
//!         .collect())
//! }
//! ```
//!
//! The batch function gets the keys of one batch, in the order they were
//! first requested, and returns one result per key. There are two ways for
//! it to fail, and they're treated differently:
//!
//! - An `Err` *element* means that one key failed (here, an unknown user).
//!   This is an ordinary answer for that key: it is cached, and loading the
//!   key again returns the same error without another call.
//! - An `Err` for the *whole call* means the batch itself failed (here, the
//!   API is down). Every key in the batch fails with
//!   [`LoadError::Batch`], and none of them are cached, so loading them again
//!   triggers a new call.
//!
//! Once you have a batch function, start a [`Loader`] with it:
//!
//! ```
//! # #[derive(Debug, Clone)] struct UserData { username: String, age: u16 }
//! # #[derive(Debug, Clone, PartialEq)] enum ApiError { NoSuchUser, Unavailable }
//! # async fn get_users(usernames: Vec<String>) ->
//! #     Result<Vec<Result<UserData, ApiError>>, ApiError> {
//! #     Ok(usernames.into_iter().map(|username| match username.as_str() {
//! #         "nobody" => Err(ApiError::NoSuchUser),
//! #         _ => Ok(UserData { username, age: 30 }),
//! #     }).collect())
//! # }
//! use std::time::Duration;
//! use batchcache::{LoadError, Loader, LoaderConfig};
//!
//! let config = LoaderConfig::default()
//!     .with_max_batch_size(100)
//!     .with_max_batch_time(Duration::from_millis(2));
//!
//! let loader = Loader::start(get_users, config)?;
//!
//! // These are collected into the same batch
//! let alice = loader.load("alice".to_string())?;
//! let nobody = loader.load("nobody".to_string())?;
//!
//! assert_eq!(alice.wait().unwrap().username, "alice");
//! assert_eq!(nobody.wait().unwrap_err(), LoadError::Rejected(ApiError::NoSuchUser));
//!
//! // Cached: this doesn't call get_users again
//! let again = loader.load("alice".to_string())?;
//! assert!(again.ptr_eq(&alice));
//! # Ok::<(), batchcache::LoaderError>(())
//! ```
//!
//! A [`Loader`] is configured with a [`LoaderConfig`]:
//!
//! - `max_batch_time` is the batching window: how long a batch keeps
//!   accepting keys after its first key arrives. For a typical web
//!   application this is a few milliseconds.
//! - `max_batch_size` is an optional maximum number of keys per batch. If
//!   set, the batch is dispatched immediately when this number of keys is
//!   reached, regardless of the window.
//! - `buffer_size` bounds the queue of keys waiting to be batched. If it is
//!   full, `load` waits for up to `enqueue_timeout`, then fails with
//!   [`LoaderError::QueueFull`] rather than waiting forever.
//!
//! [`Loader::load`] returns a [`BatchFuture`]. It can be read by blocking a
//! thread with [`BatchFuture::wait`], or awaited from any async executor;
//! either way, the batch is driven by the loader's own background threads.
//!
//! ```
//! # use batchcache::{Loader, LoaderConfig};
//! # use futures::future;
//! let loader = Loader::start(
//!     |keys: Vec<u32>| {
//!         future::ready(Ok::<_, ()>(keys.into_iter().map(|k| Ok(k * 2)).collect::<Vec<_>>()))
//!     },
//!     LoaderConfig::default(),
//! )?;
//!
//! let doubled = loader.load_many(vec![1, 2, 3])?;
//! assert_eq!(futures::executor::block_on(doubled), vec![Ok(2), Ok(4), Ok(6)]);
//! # Ok::<(), batchcache::LoaderError>(())
//! ```
//!
//! ## Design notes
//!
//! ### One pipeline per loader
//!
//! Each loader owns two background threads. The collector reads newly
//! registered keys from a bounded queue and closes a batch when it is full
//! or when its window elapses. The dispatcher calls the batch function for
//! one batch at a time, in the order the batches were formed, and runs the
//! function's future to completion on its own thread. Because the batch is
//! driven in the background, a `BatchFuture` that is never polled or waited
//! on doesn't hold up anyone else's results.
//!
//! ### One fetch per key
//!
//! The cache maps each key to a single write-once slot. The first `load` of
//! a key creates the slot and queues the key; every later `load` (from any
//! thread) gets a handle to the same slot, until the key is cleared. Keys
//! that fail as part of a whole-batch failure are evicted before their
//! handles are resolved, so retrying is always possible.
//!
//! ### Shutting down
//!
//! [`Loader::stop`], which is also called when the loader is dropped,
//! closes the queue. Keys that were already queued are still fetched, and
//! `stop` waits for the pipeline to drain.

mod cache;
mod collector;
mod config;
mod dispatcher;
mod error;
mod future;
mod loader;
mod wakerset;

pub use config::LoaderConfig;
pub use error::{LoadError, LoaderError};
pub use future::{BatchFuture, LoadMany};
pub use loader::Loader;
