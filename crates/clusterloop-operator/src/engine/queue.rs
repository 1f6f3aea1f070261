//! De-duplicating work queue with per-key retry backoff

use crate::config::EngineConfig;
use crate::observability::metrics::set_queue_depth;
use clusterloop_core::ClusterKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ClusterKey>,
    queued: HashSet<ClusterKey>,
    processing: HashSet<ClusterKey>,
    /// Keys changed while being processed; queued again on `done`.
    dirty: HashSet<ClusterKey>,
    failures: HashMap<ClusterKey, u32>,
    shut_down: bool,
}

impl QueueState {
    fn push(&mut self, key: ClusterKey) -> bool {
        if self.queued.insert(key.clone()) {
            self.pending.push_back(key);
            true
        } else {
            false
        }
    }
}

/// Keys waiting to be reconciled.
///
/// A key is held by at most one worker: adding a key that is being processed
/// marks it dirty instead of queueing it, and `done` queues it again.
pub struct WorkQueue {
    name: &'static str,
    config: EngineConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    timers: CancellationToken,
}

impl WorkQueue {
    pub fn new(name: &'static str, config: EngineConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            timers: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: ClusterKey) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        if state.processing.contains(&key) {
            trace!(queue = self.name, key = %key, "Key busy, marking dirty");
            state.dirty.insert(key);
            return;
        }
        if state.push(key) {
            set_queue_depth(self.name, state.pending.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ClusterKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let stop = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Record a failure for `key` and queue it after the matching backoff.
    pub fn add_rate_limited(self: &Arc<Self>, key: ClusterKey) -> Duration {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.config.backoff_for(failures);
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &ClusterKey) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &ClusterKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ClusterKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    set_queue_depth(self.name, state.pending.len());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; queues it again if it changed meanwhile.
    pub fn done(&self, key: &ClusterKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shut_down && state.push(key.clone()) {
            set_queue_depth(self.name, state.pending.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and drop pending timers.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shut_down = true;
            state.pending.clear();
            state.queued.clear();
            state.dirty.clear();
        }
        self.timers.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
