//! Deduplicating work queue of pod keys
//!
//! A key is queued at most once at a time: adding a key that is already
//! waiting is a no-op, so bursts of events for the same pod collapse into a
//! single reconcile of whatever state is cached when the key comes up.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    shutting_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key
    ///
    /// Returns false if the key was already waiting or the queue is shut down.
    pub fn add(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        {
            let mut state = self.lock();
            if state.shutting_down || !state.queued.insert(key.clone()) {
                return false;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next key
    ///
    /// After [`shut_down`](Self::shut_down) the remaining keys are still
    /// handed out; `None` is returned once the queue is empty.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a wakeup between the check and the await is kept
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting keys and wake every waiting consumer
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}
