use parking_lot::Mutex;
use std::{collections::VecDeque, time::Duration};
use tokio::sync::Notify;

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO shared between one producer loop and one consumer loop.
/// `push` waits for space, `pop` waits for an item. After `close` pushes fail
/// and pops drain what is left, then return `None`.
pub struct BlockingQueue<T> {
    inner: Mutex<QueueInner<T>>,
    items: Notify,
    space: Notify,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            items: Notify::new(),
            space: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Hands the item back if the queue is closed.
    pub async fn push(&self, item: T) -> Result<(), T> {
        loop {
            let notified = self.space.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(item);
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    drop(inner);
                    self.items.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.items.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.space.notify_waiters();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait for at least one item, then take up to `max`. Empty only once the
    /// queue is closed and drained.
    pub async fn pop_batch(&self, max: usize) -> Vec<T> {
        let Some(first) = self.pop().await else {
            return Vec::new();
        };
        let mut batch = vec![first];
        {
            let mut inner = self.inner.lock();
            while batch.len() < max.max(1) {
                match inner.items.pop_front() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
        }
        self.space.notify_waiters();
        batch
    }

    /// `None` on timeout or when closed and drained.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pop()).await.ok().flatten()
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Drop every queued item; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            let n = inner.items.len();
            inner.items.clear();
            n
        };
        self.space.notify_waiters();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
