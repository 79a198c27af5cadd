//! Rate-limited work queue of namespace keys.
//!
//! Semantics:
//! - A key is held at most once in the queue (deduplication)
//! - A key is handed to at most one worker at a time; adding it while it is
//!   being processed marks it dirty, and it is queued again on `done`
//! - Delivery is at-least-once: a key is never dropped while dirty
//! - Transient failures are retried with exponential backoff per key

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

use crate::config::QueueConfig;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

/// Work queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub delayed: usize,
}

/// Work queue with per-key deduplication.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    shutting_down: AtomicBool,
    delayed: AtomicUsize,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            delayed: AtomicUsize::new(0),
            config,
        }
    }

    /// Enqueue a key.
    pub async fn add(&self, key: &str) {
        if self.is_shutting_down() {
            return;
        }

        let mut state = self.state.lock().await;
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        self.delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key).await;
            queue.delayed.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Re-enqueue a key after a transient failure.
    ///
    /// Returns the backoff applied, or `None` if the key exhausted its
    /// retries and was dropped.
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) -> Option<Duration> {
        let failures = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };

        if failures > self.config.max_retries {
            error!(key = %key, failures, "Giving up on key after repeated failures");
            self.forget(key).await;
            return None;
        }

        let delay = self.config.backoff(failures - 1);
        debug!(key = %key, failures, delay_ms = delay.as_millis() as u64, "Retrying key with backoff");
        self.add_after(key, delay);
        Some(delay)
    }

    /// Clear the failure history of a key.
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    /// Consecutive transient failures recorded for a key.
    pub async fn failures(&self, key: &str) -> u32 {
        self.state.lock().await.failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutting_down() {
                return None;
            }
            if let Some(key) = self.try_get().await {
                return Some(key);
            }

            notified.await;
        }
    }

    /// Take the next key without waiting.
    pub async fn try_get(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let key = state.queue.pop_front()?;
        state.queued.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Mark a key as processed; re-queue it if it was added meanwhile.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued: state.queue.len(),
            processing: state.processing.len(),
            delayed: self.delayed.load(Ordering::SeqCst),
        }
    }

    /// No key is queued, in flight or waiting on a backoff timer.
    pub async fn is_idle(&self) -> bool {
        let stats = self.stats().await;
        stats.queued == 0 && stats.processing == 0 && stats.delayed == 0
    }
}
