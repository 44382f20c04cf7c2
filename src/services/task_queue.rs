//! Bounded FIFO task queue.
//!
//! The queue is a monitor: a mutex-guarded deque plus a notifier. FIFO
//! order is strict — the n-th successful [`TaskQueue::add`] is the n-th
//! [`TaskQueue::get`] to return. Readers and writers may call concurrently.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::domain::models::TaskRequest;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full (capacity {0})")]
    Full(usize),

    #[error("queue is empty")]
    Empty,

    /// Sentinel returned when a blocking get is released by its cancel
    /// signal instead of a task.
    #[error("blocking get interrupted")]
    Interrupted,
}

/// Thread-safe bounded FIFO queue of task requests.
pub struct TaskQueue {
    items: Mutex<VecDeque<TaskRequest>>,
    notify: Notify,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a task; fails with [`QueueError::Full`] at capacity.
    pub fn add(&self, task: TaskRequest) -> Result<(), QueueError> {
        {
            let mut items = self.items.lock().expect("queue mutex poisoned");
            if items.len() >= self.capacity {
                return Err(QueueError::Full(self.capacity));
            }
            items.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking pop; fails with [`QueueError::Empty`] if nothing queued.
    pub fn get(&self) -> Result<TaskRequest, QueueError> {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
            .ok_or(QueueError::Empty)
    }

    /// Block until a task is available or `cancel` fires.
    ///
    /// On cancellation (or a [`TaskQueue::wakeup`] observed while the
    /// cancel signal is set) returns [`QueueError::Interrupted`].
    pub async fn get_blocking(&self, cancel: &CancellationToken) -> Result<TaskRequest, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the emptiness check so a concurrent add's
            // notification is not lost.
            notified.as_mut().enable();

            if let Ok(task) = self.get() {
                return Ok(task);
            }
            if cancel.is_cancelled() {
                return Err(QueueError::Interrupted);
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => return Err(QueueError::Interrupted),
            }
        }
    }

    /// Clone of the front task without removing it.
    pub fn peek(&self) -> Option<TaskRequest> {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .front()
            .cloned()
    }

    pub fn size(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.items.lock().expect("queue mutex poisoned").clear();
    }

    /// Execution ids of all queued tasks, front first. For observability.
    pub fn list(&self) -> Vec<String> {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .iter()
            .map(|t| t.execution_id.clone())
            .collect()
    }

    /// Release every blocked waiter without adding a task. Used at
    /// shutdown; woken waiters re-check their cancel signal.
    pub fn wakeup(&self) {
        self.notify.notify_waiters();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(id: &str) -> TaskRequest {
        TaskRequest::new(id, "prompt")
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new(10);
        for i in 0..5 {
            queue.add(task(&format!("t{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.get().unwrap().execution_id, format!("t{i}"));
        }
        assert_eq!(queue.get().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn test_capacity_bound() {
        let queue = TaskQueue::new(3);
        for i in 0..3 {
            queue.add(task(&format!("t{i}"))).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.add(task("t3")).unwrap_err(), QueueError::Full(3));

        // One get frees one slot.
        queue.get().unwrap();
        queue.add(task("t3")).unwrap();
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = TaskQueue::new(2);
        queue.add(task("t0")).unwrap();
        assert_eq!(queue.peek().unwrap().execution_id, "t0");
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_list_and_clear() {
        let queue = TaskQueue::new(5);
        queue.add(task("a")).unwrap();
        queue.add(task("b")).unwrap();
        assert_eq!(queue.list(), vec!["a".to_string(), "b".to_string()]);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocking_wakes_on_add() {
        let queue = Arc::new(TaskQueue::new(5));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.get_blocking(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(task("t0")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.execution_id, "t0");
    }

    #[tokio::test]
    async fn test_get_blocking_interrupted_on_cancel() {
        let queue = Arc::new(TaskQueue::new(5));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.get_blocking(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        queue.wakeup();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), QueueError::Interrupted);
    }

    #[tokio::test]
    async fn test_get_blocking_returns_queued_immediately() {
        let queue = TaskQueue::new(5);
        let cancel = CancellationToken::new();
        queue.add(task("t0")).unwrap();

        let got = queue.get_blocking(&cancel).await.unwrap();
        assert_eq!(got.execution_id, "t0");
    }

    #[tokio::test]
    async fn test_concurrent_producers_drain_fully() {
        let queue = Arc::new(TaskQueue::new(100));
        let cancel = CancellationToken::new();

        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..10 {
                    queue.add(task(&format!("p{p}-{i}"))).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut drained = Vec::new();
        while let Ok(t) = queue.get_blocking(&cancel).await {
            drained.push(t.execution_id);
            if drained.len() == 40 {
                break;
            }
        }
        assert_eq!(drained.len(), 40);
        assert!(queue.is_empty());

        // Per-producer FIFO survives interleaving.
        for p in 0..4 {
            let ids: Vec<&String> = drained
                .iter()
                .filter(|id| id.starts_with(&format!("p{p}-")))
                .collect();
            let mut sorted = ids.clone();
            sorted.sort_by_key(|id| {
                id.rsplit('-').next().unwrap().parse::<u32>().unwrap()
            });
            assert_eq!(ids, sorted);
        }
    }
}
