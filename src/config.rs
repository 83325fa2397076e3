use std::{num::NonZeroUsize, time::Duration};

/// Configuration for a [`Loader`](crate::Loader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Maximum number of keys per batch. If set, a batch is dispatched as
    /// soon as it reaches this many keys, regardless of the window. `None`
    /// means batches are bounded only by time.
    pub max_batch_size: Option<NonZeroUsize>,

    /// How long a batch keeps accepting keys after its first key arrives.
    pub max_batch_time: Duration,

    /// Capacity of the queue between callers and the batching pipeline.
    pub buffer_size: NonZeroUsize,

    /// How long `load` may block on a full queue before giving up with
    /// [`LoaderError::QueueFull`](crate::LoaderError::QueueFull).
    pub enqueue_timeout: Duration,

    /// Name used for the pipeline threads and in log events.
    pub name: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            max_batch_time: Duration::from_millis(5),
            buffer_size: NonZeroUsize::new(10_000).unwrap_or(NonZeroUsize::MIN),
            enqueue_timeout: Duration::from_secs(1),
            name: String::from("loader"),
        }
    }
}

impl LoaderConfig {
    /// Creates a new configuration with the specified maximum batch size.
    /// A size of 0 means unbounded.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = NonZeroUsize::new(max_batch_size);
        self
    }

    /// Creates a new configuration with the specified batching window.
    pub fn with_max_batch_time(mut self, max_batch_time: Duration) -> Self {
        self.max_batch_time = max_batch_time;
        self
    }

    /// Creates a new configuration with the specified queue capacity.
    pub fn with_buffer_size(mut self, buffer_size: NonZeroUsize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Creates a new configuration with the specified enqueue timeout.
    pub fn with_enqueue_timeout(mut self, enqueue_timeout: Duration) -> Self {
        self.enqueue_timeout = enqueue_timeout;
        self
    }

    /// Creates a new configuration with the specified loader name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.max_batch_size, None);
        assert_eq!(config.max_batch_time, Duration::from_millis(5));
        assert_eq!(config.buffer_size.get(), 10_000);
    }

    #[test]
    fn zero_batch_size_is_unbounded() {
        let config = LoaderConfig::default().with_max_batch_size(0);
        assert_eq!(config.max_batch_size, None);

        let config = config.with_max_batch_size(4);
        assert_eq!(config.max_batch_size, NonZeroUsize::new(4));
    }
}
