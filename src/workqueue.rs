/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/workqueue.rs
*
* A keyed work queue that feeds the reconciliation workers.
*
* Architecture:
* - Keys are resource identities. A key that is already pending is not queued
*   twice; adding it again just coalesces into the pending entry.
* - A key handed to a worker moves into the `processing` set. While it is
*   there no other worker can receive it. Re-adds during that window mark the
*   key dirty and it is queued again when the worker calls `done`.
* - Failed keys are re-added through `add_rate_limited`, which tracks a
*   per-key attempt counter and delays the re-add by an exponential backoff.
*   `forget` clears the counter after a successful pass.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::metrics;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Display + 'static,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // A poisoned lock only means another worker panicked mid-update; the
        // sets are still structurally valid.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `key` as needing work.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            debug!(key = %key, "Key is being processed; deferring re-add");
            return;
        }
        state.queue.push_back(key);
        metrics::WORKQUEUE_DEPTH.set(state.queue.len() as i64);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::WORKQUEUE_DEPTH.set(state.queue.len() as i64);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
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

    /// Releases `key` after processing. If it was re-added meanwhile it goes
    /// back on the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            metrics::WORKQUEUE_DEPTH.set(state.queue.len() as i64);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Records a failure for `key` and re-adds it after the backoff delay for
    /// its attempt count. Returns the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let counter = state.failures.entry(key.clone()).or_insert(0);
            *counter = counter.saturating_add(1);
            *counter
        };
        let delay = self.inner.backoff.delay_for_attempt(attempt);
        metrics::WORKQUEUE_RETRIES_TOTAL.inc();
        debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out work. Waiting `get` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
