//! Bounded handoff queues between pipeline stages.
//!
//! Both wrappers hold the sender and receiver halves of one crossbeam channel,
//! so any clone can produce and consume. Consumers poll with `recv_timeout`
//! and check their stop flag on timeout instead of relying on disconnects.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// What happened to an item handed to a [`DropOldestQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with free capacity.
    Queued,
    /// Queued after evicting at least one older item.
    Evicted,
    /// Dropped because the queue was full.
    Skipped,
}

/// Bounded queue that never blocks the producer.
///
/// `push` makes room by discarding the oldest entries, `offer` discards the
/// new item instead. Capture threads use one or the other depending on
/// `drop_frames_when_busy`.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue `item`, evicting the oldest entries while the queue is full.
    /// Under producer contention more than one entry may be evicted.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut item = item;
        let mut evicted = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    return if evicted {
                        PushOutcome::Evicted
                    } else {
                        PushOutcome::Queued
                    }
                }
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    evicted = true;
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Skipped,
            }
        }
    }

    /// Enqueue `item` only if there is room.
    pub fn offer(&self, item: T) -> PushOutcome {
        match self.tx.try_send(item) {
            Ok(()) => PushOutcome::Queued,
            Err(_) => PushOutcome::Skipped,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

/// Bounded queue whose `send` blocks until capacity frees up.
///
/// Used where losing an item is worse than stalling the producer, such as the
/// orchestrator handing crops to the OCR pool.
pub struct BlockingBoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> BlockingBoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Block until `item` is enqueued. Returns false if the channel is gone.
    pub fn send(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Clone for BlockingBoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_evicts_oldest_when_full() {
        let q = DropOldestQueue::with_capacity(3);
        assert_eq!(q.push(1), PushOutcome::Queued);
        assert_eq!(q.push(2), PushOutcome::Queued);
        assert_eq!(q.push(3), PushOutcome::Queued);
        assert_eq!(q.push(4), PushOutcome::Evicted);
        assert_eq!(q.push(5), PushOutcome::Evicted);

        let drained: Vec<i32> = std::iter::from_fn(|| q.try_recv()).collect();
        assert_eq!(drained, vec![3, 4, 5]);
    }

    #[test]
    fn offer_skips_newest_when_full() {
        let q = DropOldestQueue::with_capacity(3);
        for i in 1..=3 {
            assert_eq!(q.offer(i), PushOutcome::Queued);
        }
        assert_eq!(q.offer(4), PushOutcome::Skipped);
        assert_eq!(q.offer(5), PushOutcome::Skipped);

        let drained: Vec<i32> = std::iter::from_fn(|| q.try_recv()).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn recv_timeout_returns_none_on_empty() {
        let q: DropOldestQueue<u8> = DropOldestQueue::with_capacity(2);
        assert!(q.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn zero_capacity_rounds_up_to_one() {
        let q = DropOldestQueue::with_capacity(0);
        assert_eq!(q.capacity(), 1);
        assert_eq!(q.push(1), PushOutcome::Queued);
        assert_eq!(q.push(2), PushOutcome::Evicted);
        assert_eq!(q.try_recv(), Some(2));
    }

    #[test]
    fn blocking_send_waits_for_capacity() {
        let q = BlockingBoundedQueue::with_capacity(1);
        assert!(q.send(1));

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                // blocks until the consumer drains the first item
                assert!(q.send(2));
                assert!(q.send(3));
            })
        };

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(q.recv_timeout(Duration::from_secs(1)).unwrap());
        }
        producer.join().unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(q.try_recv().is_none());
    }
}
