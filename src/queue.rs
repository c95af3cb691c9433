//! De-duplicating work queue with rate-limited retries.
//!
//! A key is never handed to two workers at once: a key added while being processed is queued
//! again when the worker calls [`Queue::done`].

use std::collections::{BTreeMap as Map, BTreeSet as Set, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Per-key exponential backoff: `base * 2^failures`, capped to `max`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// queued or waiting to be queued again
    dirty: Set<K>,
    processing: Set<K>,
    requeues: Map<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

pub struct Queue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Queue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Ord + Clone + Send + Sync + 'static> Queue<K> {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: Set::new(),
                    processing: Set::new(),
                    requeues: Map::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.inner.notify.notify_one();
    }

    /// Adds the key after its backoff delay. Each call counts as one more failure of the key.
    pub async fn add_rate_limited(&self, key: K) -> JoinHandle<()> {
        let delay = {
            let mut state = self.inner.state.lock().await;
            let failures = state.requeues.entry(key.clone()).or_default();
            let delay = self.inner.backoff.delay(*failures);
            *failures += 1;
            delay
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        })
    }

    /// Next key to process, waiting for one. `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks the end of the processing of `key`.
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Resets the failure count of `key`.
    pub async fn forget(&self, key: &K) {
        self.inner.state.lock().await.requeues.remove(key);
    }

    pub async fn num_requeues(&self, key: &K) -> u32 {
        let state = self.inner.state.lock().await;
        state.requeues.get(key).copied().unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Stops accepting keys; workers get what's left then `None`.
    pub async fn shut_down(&self) {
        let mut state = self.inner.state.lock().await;
        state.shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    #[cfg(test)]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
