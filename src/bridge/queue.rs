//! Bounded drop-oldest queue between the sampling and forwarding flows
//!
//! The producer never blocks: when the queue is full the oldest sample is evicted and
//! an overflow is recorded, favouring fresh readings over complete history. Samples that
//! fail to publish go back to the head with [`PublishQueue::requeue`] so that retries
//! never reorder the stream.

use crate::sensor::Sample;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Publish queue closed")]
    QueueClosed,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Sample>,
    closed: bool,
}

#[derive(Debug)]
pub struct PublishQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    available: Notify,
    closed: CancellationToken,
    overflows: AtomicU64,
}

impl PublishQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("Created publish queue with capacity {}", capacity);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            available: Notify::new(),
            closed: CancellationToken::new(),
            overflows: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a sample, evicting the oldest one when full
    ///
    /// Returns the evicted sample, if any.
    pub fn enqueue(&self, sample: Sample) -> Result<Option<Sample>, QueueError> {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::QueueClosed);
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(sample);
            evicted
        };

        if let Some(evicted) = &evicted {
            self.record_overflow(evicted, "evicted");
        }
        self.available.notify_one();
        Ok(evicted)
    }

    /// Puts a sample back at the head after a failed publish
    ///
    /// When the queue is full the requeued sample is the oldest one, so it is the one
    /// dropped. Returns whether the sample was kept.
    pub fn requeue(&self, sample: Sample) -> Result<bool, QueueError> {
        let kept = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::QueueClosed);
            }
            if inner.items.len() >= self.capacity {
                false
            } else {
                inner.items.push_front(sample);
                true
            }
        };

        if kept {
            self.available.notify_one();
        } else {
            self.record_overflow(&sample, "dropped on requeue");
        }
        Ok(kept)
    }

    /// Waits for the next sample in FIFO order
    pub async fn dequeue(&self) -> Result<Sample, QueueError> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueError::QueueClosed);
                }
                if let Some(sample) = inner.items.pop_front() {
                    return Ok(sample);
                }
            }

            tokio::select! {
                _ = self.available.notified() => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    /// Closes the queue, waking every waiter; returns the number of discarded samples
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            let discarded = inner.items.len();
            inner.items.clear();
            discarded
        };
        self.closed.cancel();

        if discarded > 0 {
            info!("Publish queue closed, discarded {} pending samples", discarded);
        } else {
            debug!("Publish queue closed");
        }
        discarded
    }

    /// Resolves once the queue is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of overflow events recorded so far
    pub fn overflow_events(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    fn record_overflow(&self, sample: &Sample, what: &str) {
        let total = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % 100 == 0 {
            warn!(
                "Publish queue overflow: {} {} (capacity {}, {} overflows so far)",
                what, sample, self.capacity, total
            );
        } else {
            debug!("Publish queue overflow: {} {}", what, sample);
        }
    }
}

impl Default for PublishQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sample(value: f32) -> Sample {
        Sample::now(value)
    }

    #[tokio::test]
    async fn full_queue_evicts_oldest_once() {
        let queue = PublishQueue::new(64);

        for i in 1..=65 {
            queue.enqueue(sample(i as f32)).unwrap();
        }

        assert_eq!(queue.len(), 64);
        assert_eq!(queue.overflow_events(), 1);

        let mut values = Vec::new();
        while !queue.is_empty() {
            values.push(queue.dequeue().await.unwrap().value as u32);
        }
        assert_eq!(values, (2..=65).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn enqueue_reports_evicted_sample() {
        let queue = PublishQueue::new(2);
        assert_eq!(queue.enqueue(sample(1.0)).unwrap(), None);
        assert_eq!(queue.enqueue(sample(2.0)).unwrap(), None);

        let evicted = queue.enqueue(sample(3.0)).unwrap().unwrap();
        assert_eq!(evicted.value, 1.0);
    }

    #[tokio::test]
    async fn requeue_goes_to_head() {
        let queue = PublishQueue::new(4);
        queue.enqueue(sample(2.0)).unwrap();
        queue.enqueue(sample(3.0)).unwrap();

        assert!(queue.requeue(sample(1.0)).unwrap());

        assert_eq!(queue.dequeue().await.unwrap().value, 1.0);
        assert_eq!(queue.dequeue().await.unwrap().value, 2.0);
        assert_eq!(queue.dequeue().await.unwrap().value, 3.0);
        assert_eq!(queue.overflow_events(), 0);
    }

    #[tokio::test]
    async fn requeue_into_full_queue_drops_the_requeued_sample() {
        let queue = PublishQueue::new(2);
        queue.enqueue(sample(2.0)).unwrap();
        queue.enqueue(sample(3.0)).unwrap();

        assert!(!queue.requeue(sample(1.0)).unwrap());
        assert_eq!(queue.overflow_events(), 1);
        assert_eq!(queue.dequeue().await.unwrap().value, 2.0);
    }

    #[tokio::test]
    async fn dequeue_waits_for_producer() {
        let queue = Arc::new(PublishQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(sample(7.0)).unwrap();

        let received = timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.value, 7.0);
    }

    #[tokio::test]
    async fn close_wakes_all_waiters() {
        let queue = Arc::new(PublishQueue::new(4));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for waiter in waiters {
            let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert_eq!(result, Err(QueueError::QueueClosed));
        }
    }

    #[tokio::test]
    async fn closed_queue_rejects_everything() {
        let queue = PublishQueue::new(4);
        queue.enqueue(sample(1.0)).unwrap();

        assert_eq!(queue.close(), 1);
        assert_eq!(queue.close(), 0);
        assert!(queue.is_closed());
        assert_eq!(queue.dequeue().await, Err(QueueError::QueueClosed));
        assert_eq!(queue.enqueue(sample(2.0)), Err(QueueError::QueueClosed));
        assert_eq!(queue.requeue(sample(2.0)), Err(QueueError::QueueClosed));
    }
}
