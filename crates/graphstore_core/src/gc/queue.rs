//! Per-channel queue of object ids awaiting marking.

use crate::types::{ChannelIndex, ObjectId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// FIFO of object ids awaiting marking by one channel.
///
/// Any channel may add to it, but only through the
/// [`MarkMonitor`](super::MarkMonitor), which counts every id it adds.
/// Only the owning channel reads from it. Reading is two-step: a batch is
/// copied out with [`peek_batch`](Self::peek_batch), processed, and only
/// then removed by the monitor's `advance_marking`. Ids being processed
/// therefore still count as queued, which keeps "queue empty" meaning
/// "nothing left to mark".
///
/// The queue has no capacity limit and adding never blocks. Channels mark
/// into each other's queues, so a full queue would stall its writer on a
/// reader that may itself be stalled writing back. Memory held by a
/// drained queue is given back by [`reset`](Self::reset).
#[derive(Debug)]
pub struct OidMarkQueue {
    channel: ChannelIndex,
    entries: Mutex<VecDeque<ObjectId>>,
    available: Condvar,
}

impl OidMarkQueue {
    /// Creates an empty queue for `channel`.
    #[must_use]
    pub fn new(channel: ChannelIndex) -> Self {
        Self {
            channel,
            entries: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// The owning channel.
    #[must_use]
    pub fn channel(&self) -> ChannelIndex {
        self.channel
    }

    pub(crate) fn enqueue(&self, oid: ObjectId) {
        self.entries.lock().push_back(oid);
        self.available.notify_one();
    }

    pub(crate) fn enqueue_all(&self, oids: &[ObjectId]) {
        if oids.is_empty() {
            return;
        }
        self.entries.lock().extend(oids.iter().copied());
        self.available.notify_one();
    }

    /// Copies up to `max` ids from the front into `batch` (cleared first)
    /// without removing them. Returns the number copied.
    pub fn peek_batch(&self, batch: &mut Vec<ObjectId>, max: usize) -> usize {
        batch.clear();
        let entries = self.entries.lock();
        batch.extend(entries.iter().take(max).copied());
        batch.len()
    }

    /// Removes `amount` ids from the front. Returns how many were actually
    /// removed.
    pub(crate) fn advance(&self, amount: usize) -> usize {
        let mut entries = self.entries.lock();
        let amount = amount.min(entries.len());
        entries.drain(..amount);
        amount
    }

    /// Empties the queue if it already is empty; returns `false` if it held
    /// entries, which leaves them in place.
    pub(crate) fn reset(&self) -> bool {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            return false;
        }
        entries.shrink_to(64);
        true
    }

    /// Number of queued ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Blocks for at most `timeout` until the queue is non-empty.
    /// Returns whether it is.
    pub fn wait_for_entries(&self, timeout: Duration) -> bool {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            self.available.wait_for(&mut entries, timeout);
        }
        !entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn peek_does_not_remove() {
        let queue = OidMarkQueue::new(ChannelIndex(0));
        queue.enqueue_all(&[ObjectId(1), ObjectId(2), ObjectId(3)]);

        let mut batch = Vec::new();
        assert_eq!(queue.peek_batch(&mut batch, 2), 2);
        assert_eq!(batch, vec![ObjectId(1), ObjectId(2)]);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.advance(2), 2);
        assert_eq!(queue.peek_batch(&mut batch, 10), 1);
        assert_eq!(batch, vec![ObjectId(3)]);
        assert_eq!(queue.advance(5), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn adding_never_blocks_and_keeps_order() {
        let queue = OidMarkQueue::new(ChannelIndex(0));
        let oids: Vec<ObjectId> = (0..100_000).map(ObjectId).collect();
        for chunk in oids.chunks(1000) {
            queue.enqueue_all(chunk);
        }
        queue.enqueue(ObjectId(100_000));
        assert_eq!(queue.len(), 100_001);

        let mut batch = Vec::new();
        queue.peek_batch(&mut batch, 3);
        assert_eq!(batch, vec![ObjectId(0), ObjectId(1), ObjectId(2)]);
        assert_eq!(queue.advance(100_000), 100_000);
        queue.peek_batch(&mut batch, 3);
        assert_eq!(batch, vec![ObjectId(100_000)]);
        assert_eq!(queue.advance(1), 1);
        assert!(queue.reset());
    }

    #[test]
    fn reset_refuses_non_empty_queue() {
        let queue = OidMarkQueue::new(ChannelIndex(1));
        assert!(queue.reset());
        queue.enqueue(ObjectId(5));
        assert!(!queue.reset());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn wait_times_out_when_empty() {
        let queue = OidMarkQueue::new(ChannelIndex(0));
        let start = Instant::now();
        assert!(!queue.wait_for_entries(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wait_wakes_on_enqueue() {
        let queue = Arc::new(OidMarkQueue::new(ChannelIndex(0)));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.enqueue(ObjectId(9));
            })
        };
        assert!(queue.wait_for_entries(Duration::from_secs(5)));
        producer.join().unwrap();
    }
}
