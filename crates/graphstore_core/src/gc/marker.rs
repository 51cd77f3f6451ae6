//! Buffered submission of references to the mark monitor.

use super::monitor::MarkMonitor;
use crate::types::{ChannelLayout, ObjectId};
use std::sync::Arc;

/// Collects referenced ids per owning channel and hands them to the
/// [`MarkMonitor`] in bulk.
///
/// Buffered ids are not yet counted as pending marks. The owner must
/// [`flush`](Self::flush) before it advances its own queue, or marking
/// could look complete while references are still sitting here.
#[derive(Debug)]
pub struct ReferenceMarker {
    monitor: Arc<MarkMonitor>,
    layout: ChannelLayout,
    buffers: Vec<Vec<ObjectId>>,
    buffer_length: usize,
    buffered: usize,
}

impl ReferenceMarker {
    /// Creates a marker with `buffer_length` slots per target channel.
    #[must_use]
    pub fn new(monitor: Arc<MarkMonitor>, buffer_length: usize) -> Self {
        let layout = monitor.layout();
        let buffer_length = buffer_length.max(1);
        Self {
            buffers: layout
                .channels()
                .map(|_| Vec::with_capacity(buffer_length))
                .collect(),
            monitor,
            layout,
            buffer_length,
            buffered: 0,
        }
    }

    /// Buffers `oid` for marking. Null ids are ignored.
    pub fn mark(&mut self, oid: ObjectId) {
        if oid.is_null() {
            return;
        }
        let buffer = &mut self.buffers[self.layout.channel_of(oid).as_usize()];
        buffer.push(oid);
        self.buffered += 1;
        if buffer.len() >= self.buffer_length {
            self.flush();
        }
    }

    /// Hands every buffered id to the monitor.
    pub fn flush(&mut self) {
        if self.buffered == 0 {
            return;
        }
        self.monitor.accept_buffered(&mut self.buffers);
        self.buffered = 0;
    }

    /// Number of ids not yet handed over.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::HighestRootOid;
    use crate::types::ChannelIndex;

    #[test]
    fn full_buffer_flushes_everything() {
        let monitor = Arc::new(MarkMonitor::new(
            ChannelLayout::new(2).unwrap(),
            Arc::new(HighestRootOid),
        ));
        let mut marker = ReferenceMarker::new(Arc::clone(&monitor), 2);

        marker.mark(ObjectId(3));
        marker.mark(ObjectId::NULL);
        assert_eq!(marker.buffered(), 1);
        assert_eq!(monitor.snapshot().pending_marks, 0);

        marker.mark(ObjectId(4));
        marker.mark(ObjectId(6));
        assert_eq!(marker.buffered(), 0);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.pending_marks, 3);
        assert_eq!(snapshot.queue_lengths, vec![2, 1]);
        assert_eq!(monitor.queue(ChannelIndex(1)).len(), 1);
    }

    #[test]
    fn explicit_flush() {
        let monitor = Arc::new(MarkMonitor::new(
            ChannelLayout::new(1).unwrap(),
            Arc::new(HighestRootOid),
        ));
        let mut marker = ReferenceMarker::new(Arc::clone(&monitor), 100);
        marker.mark(ObjectId(1));
        marker.flush();
        marker.flush();
        assert_eq!(monitor.snapshot().pending_marks, 1);
    }
}
