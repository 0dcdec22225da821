//! Cross-thread callback queue.
//!
//! Any thread may push work for the loop thread; the loop thread swaps the
//! pending list out under the lock and runs it with the lock released.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

/// Work to run on the loop thread against its owned state.
pub type Callback<T> = Box<dyn FnOnce(&mut T) -> anyhow::Result<()> + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("callback queue full ({capacity} pending)")]
    Full { capacity: usize },
}

/// Bounded, mutex-guarded list of callbacks with a single consumer.
pub struct CallbackQueue<T> {
    inner: Arc<Mutex<Vec<Callback<T>>>>,
    capacity: usize,
}

impl<T> Clone for CallbackQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<T> CallbackQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Queue `callback` for the next drain.
    pub fn push<F>(&self, callback: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut T) -> anyhow::Result<()> + Send + 'static,
    {
        let mut pending = self.lock();
        if pending.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        debug!(pending = pending.len() + 1, "register callback");
        pending.push(Box::new(callback));
        Ok(())
    }

    /// Take every pending callback, leaving the queue empty.
    pub fn take(&self) -> Vec<Callback<T>> {
        std::mem::take(&mut *self.lock())
    }

    /// Run every pending callback against `target`, returning how many ran.
    ///
    /// Errors are collected rather than short-circuiting so one failing
    /// callback cannot starve the rest.
    pub fn drain_into(&self, target: &mut T) -> (usize, Vec<anyhow::Error>) {
        let callbacks = self.take();
        if !callbacks.is_empty() {
            debug!(count = callbacks.len(), "processing callbacks");
        }
        let count = callbacks.len();
        let errors = callbacks
            .into_iter()
            .filter_map(|callback| callback(target).err())
            .collect();
        (count, errors)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Callback<T>>> {
        // A panicking producer cannot leave the Vec half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
