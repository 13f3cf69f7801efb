//! Blocking FIFO between pipeline threads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use crate::error::{HalError, Result};

enum Slot<T> {
    Item(T),
    /// Unblocks one waiting consumer without carrying data.
    Wake,
}

/// Unbounded MPSC queue with timed pops. Push order is pop order.
pub struct FrameQueue<T> {
    name: String,
    tx: Sender<Slot<T>>,
    rx: Receiver<Slot<T>>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    released: AtomicUsize,
    pending: AtomicUsize,
}

/// Counters reported by [`FrameQueue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub released: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name: name.into(),
            tx,
            rx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer: append an item.
    pub fn push(&self, item: T) {
        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        // the queue owns a receiver, so the channel cannot be disconnected
        let _ = self.tx.send(Slot::Item(item));
    }

    /// Consumer: block up to `timeout` for the next item.
    ///
    /// `Ok(None)` means the wait was cut short by [`FrameQueue::wake`].
    pub fn wait_and_pop(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Slot::Item(item)) => {
                self.stats.pending.fetch_sub(1, Ordering::AcqRel);
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Ok(Some(item))
            }
            Ok(Slot::Wake) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(HalError::timed_out(format!(
                "{} empty for {:?}",
                self.name, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(HalError::invalid_operation(format!(
                "{} disconnected",
                self.name
            ))),
        }
    }

    /// Consumer: pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(Slot::Item(item)) => {
                    self.stats.pending.fetch_sub(1, Ordering::AcqRel);
                    self.stats.popped.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
                Ok(Slot::Wake) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Unblock a consumer waiting in [`FrameQueue::wait_and_pop`].
    pub fn wake(&self) {
        let _ = self.tx.send(Slot::Wake);
    }

    /// Drop every queued item and hand them back to the caller.
    pub fn release(&self) -> Vec<T> {
        let items: Vec<T> = self
            .rx
            .drain()
            .filter_map(|slot| match slot {
                Slot::Item(item) => Some(item),
                Slot::Wake => None,
            })
            .collect();
        if !items.is_empty() {
            self.stats.pending.fetch_sub(items.len(), Ordering::AcqRel);
            self.stats.released.fetch_add(items.len(), Ordering::Relaxed);
            trace!(queue = %self.name, released = items.len(), "queue released");
        }
        items
    }

    pub fn len(&self) -> usize {
        self.stats.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_order_matches_push_order() {
        let queue = FrameQueue::new("fifo");
        for i in 0..100u32 {
            queue.push(i);
        }
        let popped: Vec<u32> = (0..100)
            .map(|_| queue.wait_and_pop(Duration::from_millis(10)).unwrap().unwrap())
            .collect();
        assert_eq!(popped, (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_pop_times_out() {
        let queue: FrameQueue<u32> = FrameQueue::new("empty");
        let err = queue.wait_and_pop(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, HalError::TimedOut(_)));
    }

    #[test]
    fn wake_unblocks_consumer() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new("wake"));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_and_pop(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.wake();
        assert_eq!(consumer.join().unwrap().unwrap(), None);
    }

    #[test]
    fn release_drains_items() {
        let queue = FrameQueue::new("drain");
        queue.push(1);
        queue.wake();
        queue.push(2);
        assert_eq!(queue.release(), vec![1, 2]);
        assert_eq!(queue.len(), 0);
        let stats = queue.stats();
        assert_eq!((stats.pushed, stats.popped, stats.released), (2, 0, 2));
        assert_eq!(queue.try_pop(), None);
    }
}
