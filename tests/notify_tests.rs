//! These tests ensure that tasks awaiting a key are notified when the
//! background pipeline resolves it.

use batchcache::{Loader, LoaderConfig};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use crossbeam::channel::{self, Receiver};
use futures::{executor, future, FutureExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    thread::sleep,
    time::{Duration, Instant},
};

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default)]
struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }

    /// Wait (with a generous timeout) for this waker to be signaled
    fn wait_signaled(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);

        while !self.is_signaled() {
            if Instant::now() > deadline {
                return false;
            }
            sleep(Duration::from_millis(1));
        }

        true
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

type Fetched = future::Ready<Result<Vec<Result<String, ()>>, ()>>;

/// A batch function that blocks until the release channel is closed
fn blocking(release: Receiver<()>) -> impl Fn(Vec<u32>) -> Fetched + Send + 'static {
    move |keys| {
        let _ = release.recv();
        future::ready(Ok(keys.into_iter().map(|key| Ok(key.to_string())).collect()))
    }
}

fn config() -> LoaderConfig {
    LoaderConfig::default().with_max_batch_time(Duration::from_millis(1))
}

struct Task {
    signal: BoolWaker,
    waker: Waker,
}

impl Task {
    fn new() -> Self {
        let signal = BoolWaker::default();
        let waker = Arc::new(signal.clone()).into_waker();
        Task { signal, waker }
    }

    fn context(&self) -> Context<'_> {
        Context::from_waker(&self.waker)
    }
}

#[test]
fn pending_task_is_woken() {
    let (release_tx, release_rx) = channel::unbounded::<()>();
    let loader = Loader::start(blocking(release_rx), config()).unwrap();
    let task = Task::new();

    let mut fut = loader.load(1).unwrap();
    assert_eq!(fut.poll_unpin(&mut task.context()), Poll::Pending);
    assert!(!task.signal.is_signaled());

    drop(release_tx);

    assert!(task.signal.wait_signaled());
    assert_eq!(fut.poll_unpin(&mut task.context()), Poll::Ready(Ok("1".to_string())));
}

#[test]
fn every_handle_is_woken() {
    let (release_tx, release_rx) = channel::unbounded::<()>();
    let loader = Loader::start(blocking(release_rx), config()).unwrap();

    let mut tasks: Vec<_> = (0..4)
        .map(|_| (Task::new(), loader.load(1).unwrap()))
        .collect();

    for (task, fut) in tasks.iter_mut() {
        assert_eq!(fut.poll_unpin(&mut task.context()), Poll::Pending);
    }

    drop(release_tx);

    for (task, fut) in tasks.iter_mut() {
        assert!(task.signal.wait_signaled());
        assert_eq!(fut.poll_unpin(&mut task.context()), Poll::Ready(Ok("1".to_string())));
    }
}

#[test]
fn repoll_replaces_the_waker() {
    let (release_tx, release_rx) = channel::unbounded::<()>();
    let loader = Loader::start(blocking(release_rx), config()).unwrap();
    let first = Task::new();
    let second = Task::new();

    let mut fut = loader.load(1).unwrap();
    assert_eq!(fut.poll_unpin(&mut first.context()), Poll::Pending);
    assert_eq!(fut.poll_unpin(&mut second.context()), Poll::Pending);

    drop(release_tx);

    assert!(second.signal.wait_signaled());
    assert!(!first.signal.is_signaled());
}

#[test]
fn dropped_handle_is_not_woken() {
    let (release_tx, release_rx) = channel::unbounded::<()>();
    let loader = Loader::start(blocking(release_rx), config()).unwrap();
    let dropped = Task::new();
    let kept = Task::new();

    let mut fut1 = loader.load(1).unwrap();
    let mut fut2 = fut1.clone();
    assert_eq!(fut1.poll_unpin(&mut dropped.context()), Poll::Pending);
    assert_eq!(fut2.poll_unpin(&mut kept.context()), Poll::Pending);

    drop(fut1);
    drop(release_tx);

    // All wakers are woken together, so once the kept task is signaled, the
    // dropped one would have been too
    assert!(kept.signal.wait_signaled());
    assert!(!dropped.signal.is_signaled());
}

#[test]
fn resolved_handle_is_ready_immediately() {
    let loader = Loader::start(blocking(channel::never()), config()).unwrap();
    loader.prime(1, String::from("primed"));

    let task = Task::new();
    let mut fut = loader.load(1).unwrap();

    assert_eq!(fut.poll_unpin(&mut task.context()), Poll::Ready(Ok("primed".to_string())));
    assert!(!task.signal.is_signaled());
}

#[test]
fn load_many_is_awaitable() {
    let (release_tx, release_rx) = channel::unbounded::<()>();
    let loader = Loader::start(blocking(release_rx), config()).unwrap();

    let many = loader.load_many(vec![3, 1, 2]).unwrap();
    assert!(!many.is_resolved());
    drop(release_tx);

    let results = executor::block_on(many);
    assert_eq!(
        results,
        vec![Ok("3".to_string()), Ok("1".to_string()), Ok("2".to_string())]
    );
}
