//! A deduplicating work queue with per-key exponential backoff.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
};
use tokio::{
    sync::Notify,
    time::{self, Duration},
};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Keys are processed by at most one worker at a time. A key added while it
/// is being processed is requeued when the worker calls [`WorkQueue::done`].
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

// === impl WorkQueue ===

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
            }),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutdown || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks a key as processed, requeuing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Adds the key after a delay that doubles with each consecutive failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            let delay = BASE_DELAY
                .checked_mul(1u32.checked_shl(*failures).unwrap_or(u32::MAX))
                .map_or(MAX_DELAY, |d| d.min(MAX_DELAY));
            *failures += 1;
            delay
        };
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the failure history of a key.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }
}
