//! Bounded single-consumer queue that drops the oldest item on overflow.
//!
//! Senders never block: a slow subscriber or a stalled peer connection loses
//! its oldest backlog instead of stalling the bus.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct DeliveryQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

impl<T> DeliveryQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue; returns `false` if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = match self.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.closed {
                return false;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                if inner.dropped.is_power_of_two() {
                    warn!(dropped = inner.dropped, "Delivery queue full, dropping oldest");
                }
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item; `None` once closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut inner = match self.inner.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut inner = match self.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
