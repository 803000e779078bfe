use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Deduplicating FIFO work queue.
///
/// Informer callbacks add keys, a single worker drains them. Adding a key
/// already pending collapses into the existing item. Adding a key while it
/// is being processed marks it dirty; `done` re-queues it once, so the
/// worker always reconciles against the latest state without per-key locks.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    pending: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    shutdown: bool,
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    pub fn new() -> WorkQueue<T> {
        WorkQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    pending: HashSet::new(),
                    processing: HashSet::new(),
                    dirty: HashSet::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        if state.pending.insert(item.clone()) {
            state.queue.push_back(item);
            self.inner.notify.notify_one();
        }
    }

    /// Next item to process, or `None` after shutdown. The item stays
    /// marked as processing until `done` is called for it.
    pub async fn get(&self) -> Option<T> {
        loop {
            // registered before the state check so a wakeup between the
            // check and the await is not lost
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(item) = state.queue.pop_front() {
                    state.pending.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock().unwrap();
        state.processing.remove(item);
        if state.dirty.remove(item) && state.pending.insert(item.clone()) {
            state.queue.push_back(item.clone());
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.inner.state.lock().unwrap().shutdown = true;
        self.inner.notify.notify_waiters();
    }
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn works_identical_keys_collapse() {
        let queue: WorkQueue<String> = WorkQueue::new();
        let keys = ["test-pod", "test-pod", "test-pod1"];
        let expected_len = [1, 1, 2];
        for (key, expected) in keys.iter().zip(expected_len) {
            queue.add(key.to_string());
            assert_eq!(queue.len(), expected);
        }
    }

    #[tokio::test]
    async fn works_reenqueue_during_processing_lands_after_done() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("test-pod".to_string());

        let item = queue.get().await.unwrap();
        // the same key arrives while the worker holds it
        queue.add("test-pod".to_string());
        assert_eq!(queue.len(), 0);

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), "test-pod");
    }

    #[tokio::test]
    async fn works_shutdown_wakes_worker() {
        let queue: WorkQueue<String> = WorkQueue::new();
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.get().await });
        queue.shutdown();
        assert_eq!(handle.await.unwrap(), None);
    }
}
