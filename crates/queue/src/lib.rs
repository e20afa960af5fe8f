//! nslife queue: deduplicating FIFO work queue keyed by name, with delayed
//! requeue and per-key exponential backoff.
//!
//! A key is in at most one of three states (queued, delayed, in flight);
//! adding a key that is already present in any state is a no-op. This is what
//! keeps at most one worker on a given key.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod backoff;

pub use backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Queued,
    Delayed,
    InFlight,
}

/// Point-in-time view of one key.
#[derive(Debug, Clone)]
pub struct ItemInfo {
    pub key: String,
    pub state: ItemState,
    /// First time the key entered the queue; survives requeues.
    pub enqueued_at: Instant,
    pub retries: u32,
    pub last_error: Option<String>,
}

struct Entry {
    state: ItemState,
    enqueued_at: Instant,
    retries: u32,
    last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: FxHashMap<String, Entry>,
    ready: VecDeque<String>,
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    seq: u64,
    shutting_down: bool,
}

impl Inner {
    /// Move every due delayed key to the back of the ready list, in due order.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((due, _, _))) = self.delayed.peek() {
            if *due > now { break; }
            let Some(Reverse((_, _, key))) = self.delayed.pop() else { break };
            if let Some(e) = self.entries.get_mut(&key) {
                if e.state == ItemState::Delayed {
                    e.state = ItemState::Queued;
                    self.ready.push_back(key);
                }
            }
        }
    }

    fn next_due(&self) -> Option<Instant> { self.delayed.peek().map(|Reverse((due, _, _))| *due) }

    fn schedule(&mut self, key: String, due: Instant) {
        self.seq = self.seq.wrapping_add(1);
        self.delayed.push(Reverse((due, self.seq, key)));
    }
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self { Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), backoff } }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the maps consistent; keep going.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueue `key` for immediate processing. Returns false if it was already
    /// queued, delayed or in flight, or the queue is shutting down.
    pub fn add(&self, key: &str) -> bool {
        let added = {
            let mut g = self.lock();
            if g.shutting_down || g.entries.contains_key(key) {
                false
            } else {
                g.entries.insert(key.to_string(), Entry { state: ItemState::Queued, enqueued_at: Instant::now(), retries: 0, last_error: None });
                g.ready.push_back(key.to_string());
                true
            }
        };
        if added {
            trace!(key, "queued");
            self.notify.notify_one();
            self.publish_depth();
        }
        added
    }

    /// Enqueue `key` to become ready after `delay`. Same dedup rules as `add`.
    pub fn add_after(&self, key: &str, delay: Duration) -> bool {
        let added = {
            let mut g = self.lock();
            if g.shutting_down || g.entries.contains_key(key) {
                false
            } else {
                let now = Instant::now();
                g.entries.insert(key.to_string(), Entry { state: ItemState::Delayed, enqueued_at: now, retries: 0, last_error: None });
                g.schedule(key.to_string(), now + delay);
                true
            }
        };
        if added {
            // Wake a getter so it re-arms its timer for the new deadline.
            self.notify.notify_one();
            self.publish_depth();
        }
        added
    }

    /// Wait for the next ready key and mark it in flight. Returns `None` once
    /// the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut g = self.lock();
                if g.shutting_down {
                    return None;
                }
                g.promote_due(Instant::now());
                if let Some(key) = g.ready.pop_front() {
                    if let Some(e) = g.entries.get_mut(&key) {
                        e.state = ItemState::InFlight;
                    }
                    drop(g);
                    self.publish_depth();
                    return Some(key);
                }
                g.next_due()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Retire an in-flight key; it may be added again afterwards.
    pub fn done(&self, key: &str) {
        self.lock().entries.remove(key);
        self.publish_depth();
    }

    /// Put an in-flight key back after a failed pass, delayed by the backoff
    /// for its retry count. Returns the chosen delay.
    pub fn requeue_failed(&self, key: &str, error: &str) -> Duration {
        let retries = self.lock().entries.get(key).map(|e| e.retries).unwrap_or(0);
        let delay = self.backoff.delay_for(retries);
        self.requeue_after(key, delay, Some(error));
        delay
    }

    /// Put an in-flight key back with an explicit delay, counting a retry.
    pub fn requeue_after(&self, key: &str, delay: Duration, error: Option<&str>) {
        {
            let mut g = self.lock();
            if g.shutting_down {
                return;
            }
            let due = Instant::now() + delay;
            let retries = match g.entries.get_mut(key) {
                Some(e) => {
                    e.state = ItemState::Delayed;
                    e.retries = e.retries.saturating_add(1);
                    e.last_error = error.map(|s| s.to_string());
                    e.retries
                }
                None => {
                    g.entries.insert(
                        key.to_string(),
                        Entry { state: ItemState::Delayed, enqueued_at: Instant::now(), retries: 1, last_error: error.map(|s| s.to_string()) },
                    );
                    1
                }
            };
            g.schedule(key.to_string(), due);
            debug!(key, retries, delay_ms = delay.as_millis() as u64, "requeued");
        }
        self.notify.notify_one();
        self.publish_depth();
    }

    /// Reset the retry count (and last error) for a key that made progress.
    pub fn forget(&self, key: &str) {
        if let Some(e) = self.lock().entries.get_mut(key) {
            e.retries = 0;
            e.last_error = None;
        }
    }

    pub fn backoff(&self) -> &Backoff { &self.backoff }

    pub fn info(&self, key: &str) -> Option<ItemInfo> {
        self.lock().entries.get(key).map(|e| ItemInfo {
            key: key.to_string(),
            state: e.state,
            enqueued_at: e.enqueued_at,
            retries: e.retries,
            last_error: e.last_error.clone(),
        })
    }

    /// All keys currently tracked, oldest first.
    pub fn snapshot(&self) -> Vec<ItemInfo> {
        let g = self.lock();
        let mut out: Vec<ItemInfo> = g
            .entries
            .iter()
            .map(|(k, e)| ItemInfo { key: k.clone(), state: e.state, enqueued_at: e.enqueued_at, retries: e.retries, last_error: e.last_error.clone() })
            .collect();
        out.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.key.cmp(&b.key)));
        out
    }

    /// Number of tracked keys in any state.
    pub fn len(&self) -> usize { self.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.lock().entries.values().filter(|e| e.state == ItemState::InFlight).count() }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Stop handing out work; every pending and future `get` returns `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        debug!("work queue shut down");
    }

    fn publish_depth(&self) {
        let depth = self.len();
        gauge!("nslife_queue_depth", depth as f64);
    }
}

impl Default for WorkQueue {
    fn default() -> Self { Self::new(Backoff::default()) }
}
