//! Shared work queue.
//!
//! The one synchronization primitive the pipeline hands work through: a
//! multi-producer multi-consumer FIFO with indefinite, cancellation-aware
//! blocking pop. The overseer fills it, any number of workers drain it, and
//! the overseer can empty it wholesale on pause or relocation.
//!
//! Interior is a `parking_lot` mutex over a `VecDeque` with a
//! `tokio::sync::Notify` for wakeups — short critical sections, no await
//! points while locked.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Unbounded MPMC FIFO queue with async blocking pop.
pub struct SharedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> SharedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Appends an item and wakes one waiting consumer.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Appends a batch of items, waking one consumer per item.
    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        let mut queue = self.items.lock();
        let before = queue.len();
        queue.extend(items);
        let added = queue.len() - before;
        drop(queue);

        for _ in 0..added {
            self.notify.notify_one();
        }
        added
    }

    /// Removes and returns the front item if one is present.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Waits until an item is available and removes it.
    ///
    /// Multiple consumers may race on the same queue; each item is delivered
    /// to exactly one of them.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }

            let notified = self.notify.notified();
            // An item may have arrived between the failed pop and arming the
            // notification; re-check before parking.
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`Self::pop`], but returns `None` when `cancel` fires first.
    pub async fn pop_cancellable(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            item = self.pop() => Some(item),
        }
    }

    /// Discards every queued item, returning how many were dropped.
    ///
    /// Idempotent; used by the overseer on pause and relocation.
    pub fn drain(&self) -> usize {
        let mut queue = self.items.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Runs `f` against the front item without removing it.
    ///
    /// Keeps the lock for the duration of `f`; callers pass cheap closures.
    pub fn peek_front_with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let queue = self.items.lock();
        f(queue.front())
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue")
            .field("len", &self.len())
            .finish()
    }
}
