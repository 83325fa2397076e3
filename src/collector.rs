//! The windowing half of the pipeline: groups queued keys into batches.

use std::{
    mem,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    /// The batch reached the maximum batch size.
    Full,
    /// The batching window elapsed.
    Window,
    /// The queue was closed; this is the last batch.
    Closed,
}

/// Reads items from the loader queue and emits them as ordered batches.
///
/// A batch is closed as soon as it reaches `max_batch_size`, or when
/// `window` has elapsed since its first item arrived, whichever comes first.
/// When the queue is closed, whatever is buffered is emitted as a final
/// batch.
#[derive(Debug, Clone)]
pub(crate) struct Collector {
    pub(crate) max_batch_size: Option<NonZeroUsize>,
    pub(crate) window: Duration,
    pub(crate) name: Arc<str>,
}

impl Collector {
    #[inline]
    fn is_full(&self, len: usize) -> bool {
        match self.max_batch_size {
            Some(max) => len >= max.get(),
            None => false,
        }
    }

    /// Run until the input queue is closed and drained, or until the output
    /// is disconnected.
    pub(crate) fn run<T>(&self, input: Receiver<T>, output: Sender<Vec<T>>) {
        let mut buffer = Vec::new();

        // The window of the current batch. It opens when the first item
        // enters an empty buffer; None while the buffer is empty, or if the
        // window is too large to represent as an Instant.
        let mut deadline: Option<Instant> = None;

        loop {
            let received = match deadline {
                Some(deadline) => input.recv_deadline(deadline),
                None => input.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            let reason = match received {
                Ok(item) => {
                    if buffer.is_empty() {
                        deadline = Instant::now().checked_add(self.window);
                    }

                    buffer.push(item);
                    trace!(loader = %self.name, buffered = buffer.len(), "key accepted");

                    // Size is checked first, so a batch that fills up exactly
                    // as its window elapses is flushed as full. recv_deadline
                    // hands out queued items without checking the clock, so
                    // the window is checked here as well.
                    if self.is_full(buffer.len()) {
                        Flush::Full
                    } else if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                        Flush::Window
                    } else {
                        continue;
                    }
                }
                Err(RecvTimeoutError::Timeout) => Flush::Window,
                Err(RecvTimeoutError::Disconnected) => Flush::Closed,
            };

            deadline = None;

            if !buffer.is_empty() {
                let batch = mem::take(&mut buffer);
                debug!(loader = %self.name, size = batch.len(), reason = ?reason, "flushing batch");

                if output.send(batch).is_err() {
                    warn!(loader = %self.name, "dispatcher is gone; dropping remaining keys");
                    return;
                }
            }

            if reason == Flush::Closed {
                debug!(loader = %self.name, "queue closed; collector finished");
                return;
            }
        }
    }
}
