//! Cross-channel coordination of marking and sweeping.

use super::queue::OidMarkQueue;
use crate::error::{CoreError, CoreResult};
use crate::policy::RootOidSelector;
use crate::types::{ChannelIndex, ChannelLayout, ObjectId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Turns the per-channel collectors into one whole-graph collection.
///
/// A cycle runs `marking → sweep required → sweeping → hot complete`, and
/// a second cycle without intervening stores reaches `cold complete`, after
/// which collection idles until the next store.
///
/// Every field lives behind one lock. Queue locks are only ever taken
/// while holding it, never the other way round.
#[derive(Debug)]
pub struct MarkMonitor {
    layout: ChannelLayout,
    queues: Vec<Arc<OidMarkQueue>>,
    root_selector: Arc<dyn RootOidSelector>,
    state: Mutex<MonitorState>,
}

#[derive(Debug)]
struct MonitorState {
    pending_marks: u64,
    pending_store_updates: Vec<bool>,
    pending_store_update_count: usize,
    needs_sweep: Vec<bool>,
    sweeping_channel_count: usize,
    channel_roots: Vec<Option<ObjectId>>,
    hot_complete: bool,
    cold_complete: bool,
    sweep_generation: u64,
    hot_generation: u64,
    cold_generation: u64,
    sweep_started: Option<Instant>,
}

/// A consistent view of the monitor, taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSnapshot {
    /// Marks accepted but not yet advanced past.
    pub pending_marks: u64,
    /// Length of each channel's mark queue.
    pub queue_lengths: Vec<usize>,
    /// Channels with an index update in flight.
    pub pending_store_updates: usize,
    /// Channels that still have to sweep in the current cycle.
    pub sweeping_channels: usize,
    /// Whether the last sweep completed a cycle.
    pub hot_complete: bool,
    /// Whether two cycles completed without an intervening store.
    pub cold_complete: bool,
    /// Number of completed sweeps (all channels).
    pub sweep_generation: u64,
}

impl MarkMonitor {
    /// Creates a monitor with one empty queue per channel.
    ///
    /// Collection starts out cold complete; the first store wakes it up.
    #[must_use]
    pub fn new(layout: ChannelLayout, root_selector: Arc<dyn RootOidSelector>) -> Self {
        let count = layout.count() as usize;
        Self {
            layout,
            queues: layout
                .channels()
                .map(|channel| Arc::new(OidMarkQueue::new(channel)))
                .collect(),
            root_selector,
            state: Mutex::new(MonitorState {
                pending_marks: 0,
                pending_store_updates: vec![false; count],
                pending_store_update_count: 0,
                needs_sweep: vec![false; count],
                sweeping_channel_count: 0,
                channel_roots: vec![None; count],
                hot_complete: true,
                cold_complete: true,
                sweep_generation: 0,
                hot_generation: 0,
                cold_generation: 0,
                sweep_started: None,
            }),
        }
    }

    /// Channel layout.
    #[must_use]
    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// The mark queue of `channel`.
    #[must_use]
    pub fn queue(&self, channel: ChannelIndex) -> &Arc<OidMarkQueue> {
        &self.queues[channel.as_usize()]
    }

    fn enqueue_locked(&self, state: &mut MonitorState, oid: ObjectId) {
        state.pending_marks += 1;
        self.queues[self.layout.channel_of(oid).as_usize()].enqueue(oid);
    }

    /// Queues `oid` for marking by its owning channel. Null ids are
    /// ignored.
    pub fn accept(&self, oid: ObjectId) {
        if oid.is_null() {
            return;
        }
        let mut state = self.state.lock();
        self.enqueue_locked(&mut state, oid);
    }

    /// Queues every id in `buffers` (indexed by owning channel) and clears
    /// the buffers, all under one lock acquisition.
    pub fn accept_buffered(&self, buffers: &mut [Vec<ObjectId>]) {
        let mut state = self.state.lock();
        for (queue, buffer) in self.queues.iter().zip(buffers.iter_mut()) {
            if buffer.is_empty() {
                continue;
            }
            state.pending_marks += buffer.len() as u64;
            queue.enqueue_all(buffer);
            buffer.clear();
        }
    }

    /// Removes `amount` processed ids from `queue` and from the pending
    /// count.
    ///
    /// # Errors
    ///
    /// Returns a consistency violation if more marks are advanced than
    /// were accepted.
    pub fn advance_marking(&self, queue: &OidMarkQueue, amount: usize) -> CoreResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.pending_marks < amount as u64 {
            return Err(CoreError::consistency(
                queue.channel(),
                format!(
                    "advancing {amount} marks with only {} pending",
                    state.pending_marks
                ),
            ));
        }
        let removed = queue.advance(amount);
        if removed != amount {
            return Err(CoreError::consistency(
                queue.channel(),
                format!("mark queue held {removed} of {amount} advanced marks"),
            ));
        }
        state.pending_marks -= amount as u64;
        Ok(())
    }

    fn marking_complete(state: &MonitorState) -> bool {
        state.pending_marks == 0 && state.pending_store_update_count == 0
    }

    /// Returns `true` if no mark is pending and no store is updating an
    /// entity index.
    #[must_use]
    pub fn is_marking_complete(&self) -> bool {
        Self::marking_complete(&self.state.lock())
    }

    /// Returns `true` if `channel` has to sweep in the current cycle.
    #[must_use]
    pub fn is_pending_sweep(&self, channel: ChannelIndex) -> bool {
        self.state.lock().needs_sweep[channel.as_usize()]
    }

    /// Returns `true` if `channel` must sweep now.
    ///
    /// The first caller that finds marking complete schedules a sweep for
    /// every channel at once.
    ///
    /// # Errors
    ///
    /// Returns a consistency violation if a queue still holds ids although
    /// no mark is pending.
    pub fn needs_sweep(&self, channel: ChannelIndex) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if state.needs_sweep[channel.as_usize()] {
            return Ok(true);
        }
        if state.sweeping_channel_count > 0 || !Self::marking_complete(&state) {
            return Ok(false);
        }

        for queue in &self.queues {
            if !queue.reset() {
                return Err(CoreError::consistency(
                    queue.channel(),
                    format!("mark queue holds {} ids with no mark pending", queue.len()),
                ));
            }
        }
        state.channel_roots.iter_mut().for_each(|root| *root = None);
        state.needs_sweep.iter_mut().for_each(|flag| *flag = true);
        state.sweeping_channel_count = state.needs_sweep.len();
        state.sweep_started = Some(Instant::now());
        debug!(generation = state.sweep_generation + 1, "sweep scheduled for all channels");
        Ok(true)
    }

    /// Records that `channel` finished its sweep and reports its local
    /// root candidate.
    ///
    /// The last channel to finish advances completion and re-seeds marking
    /// from the selected root.
    pub fn complete_sweep(&self, channel: ChannelIndex, root: Option<ObjectId>) {
        let mut state = self.state.lock();
        let index = channel.as_usize();
        if !state.needs_sweep[index] {
            return;
        }
        state.channel_roots[index] = root;
        state.needs_sweep[index] = false;
        state.sweeping_channel_count -= 1;
        if state.sweeping_channel_count > 0 {
            return;
        }

        state.sweep_generation += 1;
        let elapsed = state.sweep_started.take().map(|start| start.elapsed());
        Self::advance_completion(&mut state);
        debug!(generation = state.sweep_generation, ?elapsed, "sweep completed on all channels");

        if let Some(root) = self.root_selector.select_root(&state.channel_roots) {
            self.enqueue_locked(&mut state, root);
        }
    }

    fn advance_completion(state: &mut MonitorState) {
        if state.cold_complete {
            debug!("garbage collection already complete");
        } else if state.hot_complete {
            state.cold_complete = true;
            state.cold_generation += 1;
            info!(
                generation = state.cold_generation,
                sweeps = state.sweep_generation,
                "garbage collection cold complete"
            );
        } else {
            state.hot_complete = true;
            state.hot_generation += 1;
            debug!(generation = state.hot_generation, "garbage collection hot complete");
        }
    }

    /// Returns `true` if `channel` has nothing left to do for collection:
    /// cold complete, or hot complete and this channel already swept in
    /// the follow-up cycle.
    #[must_use]
    pub fn is_complete(&self, channel: ChannelIndex) -> bool {
        let state = self.state.lock();
        state.cold_complete
            || (state.hot_complete
                && state.sweeping_channel_count > 0
                && !state.needs_sweep[channel.as_usize()])
    }

    /// Returns `true` once collection is cold complete.
    #[must_use]
    pub fn is_cold_complete(&self) -> bool {
        self.state.lock().cold_complete
    }

    /// Forgets any completion, forcing at least two more sweeps.
    pub fn reset_completion(&self) {
        let mut state = self.state.lock();
        state.hot_complete = false;
        state.cold_complete = false;
    }

    /// Flags that `channel` is about to update its entity index after a
    /// store, and resets completion.
    pub fn register_pending_store_update(&self, channel: ChannelIndex) {
        let mut state = self.state.lock();
        let flag = &mut state.pending_store_updates[channel.as_usize()];
        if !*flag {
            *flag = true;
            state.pending_store_update_count += 1;
        }
        state.hot_complete = false;
        state.cold_complete = false;
    }

    /// Clears the pending store update flag of `channel`.
    pub fn clear_pending_store_update(&self, channel: ChannelIndex) {
        let mut state = self.state.lock();
        let flag = &mut state.pending_store_updates[channel.as_usize()];
        if *flag {
            *flag = false;
            state.pending_store_update_count -= 1;
        }
    }

    /// Number of completed sweeps.
    #[must_use]
    pub fn sweep_generation(&self) -> u64 {
        self.state.lock().sweep_generation
    }

    /// Takes a consistent snapshot, including queue lengths.
    #[must_use]
    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.state.lock();
        MonitorSnapshot {
            pending_marks: state.pending_marks,
            queue_lengths: self.queues.iter().map(|queue| queue.len()).collect(),
            pending_store_updates: state.pending_store_update_count,
            sweeping_channels: state.sweeping_channel_count,
            hot_complete: state.hot_complete,
            cold_complete: state.cold_complete,
            sweep_generation: state.sweep_generation,
        }
    }
}
