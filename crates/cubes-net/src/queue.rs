//! Thread-safe packet queues between the I/O threads and the tick thread.
//!
//! Two orderings share one blocking implementation: [`FifoQueue`] hands items
//! out in arrival order, [`PriorityQueue`] hands out the highest
//! [`Priority`] first and falls back to arrival order on ties so equal-priority
//! traffic cannot starve. Producers never block; `take` blocks the single
//! consumer until an item arrives or the queue is closed.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::packet::Priority;

/// Items that carry their own dequeue priority.
pub trait Prioritized {
    /// Priority used by [`PriorityQueue`].
    fn priority(&self) -> Priority;
}

/// Returned by `push` once the queue is closed. Gives the item back.
#[derive(Debug, thiserror::Error)]
#[error("queue is closed")]
pub struct QueueClosed<T>(pub T);

/// Operations shared by both queue orderings.
pub trait PacketQueue<T>: Send + Sync {
    /// Append an item. Never blocks; fails only after [`close`](Self::close).
    fn push(&self, item: T) -> Result<(), QueueClosed<T>>;

    /// Remove and return everything currently queued, in queue order.
    fn drain(&self) -> Vec<T>;

    /// Block until an item is available. Returns `None` once the queue is closed.
    fn take(&self) -> Option<T>;

    /// Reject further pushes and wake a consumer blocked in `take`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-destructive, human-readable listing of at most `max_items` entries
    /// in queue order. `max_items == 0` lists everything.
    fn inspect(&self, max_items: usize) -> Vec<String>;
}

/// Storage strategy behind a [`BlockingQueue`].
pub trait QueueOrder<T>: Default + Send {
    fn insert(&mut self, item: T, seq: u64);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
    fn take_all(&mut self) -> Vec<T>;
    fn ordered(&self) -> Vec<&T>;
}

/// Arrival-order storage.
pub struct Arrival<T>(VecDeque<T>);

impl<T> Default for Arrival<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

impl<T: Send> QueueOrder<T> for Arrival<T> {
    fn insert(&mut self, item: T, _seq: u64) {
        self.0.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn take_all(&mut self) -> Vec<T> {
        self.0.drain(..).collect()
    }

    fn ordered(&self) -> Vec<&T> {
        self.0.iter().collect()
    }
}

struct Ranked<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    // Max-heap: higher priority wins, then the earlier sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Descending-priority storage, stable on ties.
pub struct ByPriority<T>(BinaryHeap<Ranked<T>>);

impl<T> Default for ByPriority<T> {
    fn default() -> Self {
        Self(BinaryHeap::new())
    }
}

impl<T: Prioritized + Send> QueueOrder<T> for ByPriority<T> {
    fn insert(&mut self, item: T, seq: u64) {
        self.0.push(Ranked {
            priority: item.priority(),
            seq,
            item,
        });
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|ranked| ranked.item)
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn take_all(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.0.pop().map(|ranked| ranked.item)).collect()
    }

    fn ordered(&self) -> Vec<&T> {
        let mut ranked: Vec<&Ranked<T>> = self.0.iter().collect();
        ranked.sort_by(|a, b| b.cmp(a));
        ranked.into_iter().map(|r| &r.item).collect()
    }
}

struct State<O> {
    items: O,
    closed: bool,
    next_seq: u64,
}

/// Unbounded blocking queue parameterised by its ordering.
pub struct BlockingQueue<T, O: QueueOrder<T>> {
    state: Mutex<State<O>>,
    available: Condvar,
    _item: std::marker::PhantomData<fn() -> T>,
}

/// Arrival-order queue.
pub type FifoQueue<T> = BlockingQueue<T, Arrival<T>>;

/// Highest-priority-first queue.
pub type PriorityQueue<T> = BlockingQueue<T, ByPriority<T>>;

impl<T, O: QueueOrder<T>> BlockingQueue<T, O> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: O::default(),
                closed: false,
                next_seq: 0,
            }),
            available: Condvar::new(),
            _item: std::marker::PhantomData,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, O: QueueOrder<T>> Default for BlockingQueue<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, O> PacketQueue<T> for BlockingQueue<T, O>
where
    T: fmt::Debug + Send,
    O: QueueOrder<T>,
{
    fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed(item));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.items.insert(item, seq);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn drain(&self) -> Vec<T> {
        self.lock().items.take_all()
    }

    fn take(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop() {
                return Some(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn inspect(&self, max_items: usize) -> Vec<String> {
        let state = self.lock();
        let ordered = state.items.ordered();
        if ordered.is_empty() {
            return vec!["<empty>".to_string()];
        }

        let mut out = Vec::new();
        for (count, item) in ordered.into_iter().enumerate() {
            if max_items > 0 && count >= max_items {
                out.push(format!("... (truncated, max_items={max_items})"));
                break;
            }
            out.push(format!("{item:?}"));
        }
        out
    }
}

/// Which ordering an outbound queue uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueOrdering {
    /// Strict arrival order.
    Fifo,
    /// Descending priority, arrival order on ties.
    #[default]
    Priority,
}

impl QueueOrdering {
    /// Build an empty queue with this ordering.
    pub fn build<T>(self) -> Arc<dyn PacketQueue<T>>
    where
        T: Prioritized + fmt::Debug + Send + 'static,
    {
        match self {
            QueueOrdering::Fifo => Arc::new(FifoQueue::<T>::new()),
            QueueOrdering::Priority => Arc::new(PriorityQueue::<T>::new()),
        }
    }
}
