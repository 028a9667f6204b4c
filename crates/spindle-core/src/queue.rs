//! Blocking multi-producer FIFO used to hand commands to a worker thread.
//!
//! Producers never block on [`push`](BlockingQueue::push); the consumer blocks
//! in [`pop`](BlockingQueue::pop) until an item arrives. Ordering is exact:
//! items come out in the order they acquired the internal lock.
//!
//! A queue ends its life by being *sealed*: [`seal`](BlockingQueue::seal)
//! puts one terminal item at the head and refuses every later push. Whatever
//! is still queued behind the terminal item is reclaimed with
//! [`drain`](BlockingQueue::drain).

use crate::error::QueueClosed;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

struct State<T> {
    items: VecDeque<T>,
    sealed: bool,
}

/// Unbounded, thread-safe FIFO with blocking pop.
pub struct BlockingQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> BlockingQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                sealed: false,
            }),
            available: Condvar::new(),
        }
    }

    // The deque stays consistent even if a holder panicked, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an item. Never blocks; fails only once the queue is sealed.
    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        if state.sealed {
            return Err(QueueClosed);
        }
        state.items.push_back(item);
        let depth = state.items.len();
        drop(state);
        self.available.notify_one();
        tracing::trace!(depth, "Item pushed");
        Ok(())
    }

    /// Remove the head item, blocking until one exists.
    pub fn pop(&self) -> T {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return item;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Remove the head item if there is one.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Non-blocking snapshot: is anything queued right now?
    pub fn has_item(&self) -> bool {
        !self.lock().items.is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        !self.has_item()
    }

    /// True once [`seal`](Self::seal) or [`drain`](Self::drain) has run.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Place `terminal` at the head of the queue and refuse further pushes.
    ///
    /// The terminal item is the next thing any consumer pops. Fails if the
    /// queue was already sealed, in which case `terminal` is dropped.
    pub fn seal(&self, terminal: T) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        if state.sealed {
            return Err(QueueClosed);
        }
        state.sealed = true;
        state.items.push_front(terminal);
        let behind = state.items.len() - 1;
        drop(state);
        self.available.notify_all();
        tracing::trace!(behind, "Queue sealed");
        Ok(())
    }

    /// Seal the queue and take every item still in it.
    ///
    /// Must only be called once no consumer is blocked in [`pop`](Self::pop)
    /// waiting for work it expects to receive.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        state.sealed = true;
        state.items.drain(..).collect()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
