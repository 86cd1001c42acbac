//! Keyed, delayed, retrying work queue
//!
//! The concurrency primitive under the reconcile loop: producers add
//! keys, optionally with a delay, and a consumer awaits the next ready
//! key. A key queued twice collapses into one entry scheduled at the
//! earlier deadline. Per-key retry counters drive exponential backoff.

use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Unbounded work queue with per-key scheduling and retry tracking
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

struct State<K> {
    heap: BinaryHeap<ScheduledEntry<K>>,
    /// Authoritative deadline per pending key; heap entries that disagree
    /// are stale and skipped on pop.
    pending: HashMap<K, Instant>,
    retries: HashMap<K, u32>,
    seq: u64,
    shut_down: bool,
}

struct ScheduledEntry<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for ScheduledEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for ScheduledEntry<K> {}

impl<K> PartialOrd for ScheduledEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for ScheduledEntry<K> {
    // Reversed so the binary heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
                retries: HashMap::new(),
                seq: 0,
                shut_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().expect("work queue lock poisoned")
    }

    /// Queue a key for immediate processing.
    pub fn add(&self, key: K) {
        self.add_after(key, Duration::ZERO);
    }

    /// Queue a key to become ready after `delay`. If the key is already
    /// pending, the earlier deadline wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            match state.pending.get(&key) {
                Some(&existing) if existing <= ready_at => return,
                _ => {}
            }
            state.pending.insert(key.clone(), ready_at);
            state.seq += 1;
            let seq = state.seq;
            state.heap.push(ScheduledEntry { ready_at, seq, key });
        }
        self.notify.notify_one();
    }

    /// Re-queue a key after a failure, with exponential backoff derived
    /// from its retry count. Returns the attempt number.
    pub fn requeue_backoff(&self, key: &K) -> u32 {
        let attempt = {
            let mut state = self.state();
            let count = state.retries.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        self.add_after(key.clone(), delay);
        attempt
    }

    /// Number of failed attempts recorded for a key.
    pub fn retries(&self, key: &K) -> u32 {
        self.state().retries.get(key).copied().unwrap_or(0)
    }

    /// Clear a key's retry counter.
    pub fn forget(&self, key: &K) {
        self.state().retries.remove(key);
    }

    /// Number of keys pending, including those scheduled in the future.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue: pending items are discarded and `next` returns
    /// `None` to every waiter.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shut_down = true;
            state.heap.clear();
            state.pending.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Wait for the next ready key. Returns `None` once the queue has
    /// shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();

            let deadline = {
                let mut state = self.state();
                if state.shut_down {
                    return None;
                }
                let now = Instant::now();
                loop {
                    let (ready_at, current) = match state.heap.peek() {
                        None => break None,
                        Some(entry) => (
                            entry.ready_at,
                            state.pending.get(&entry.key) == Some(&entry.ready_at),
                        ),
                    };
                    if !current {
                        state.heap.pop();
                        continue;
                    }
                    if ready_at <= now {
                        if let Some(entry) = state.heap.pop() {
                            state.pending.remove(&entry.key);
                            return Some(entry.key);
                        }
                        continue;
                    }
                    break Some(ready_at);
                }
            };

            match deadline {
                Some(ready_at) => {
                    tokio::select! {
                        _ = sleep_until(ready_at) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
