//! Channel workers.
//!
//! Every channel runs one thread that exclusively owns the channel's
//! [`EntityCache`] and [`FileManager`]. Requests arrive as [`Command`]s on
//! a bounded inbox and are processed one at a time:
//!
//! ```text
//!  Database ──Command──> inbox ──> ┌──────────────────────────┐
//!                                  │ worker thread            │
//!           <──reply─────────────  │  EntityCache             │
//!                                  │  FileManager             │
//!  other channels ──OidMarkQueue─> │  housekeeping round-robin│
//!                                  └──────────────────────────┘
//! ```
//!
//! After each command, and whenever the inbox stays quiet for a
//! housekeeping interval, the worker spends part of a rolling time budget
//! on background work: file cleanup, garbage collection and the cache
//! live check, in turn. At least one of them runs per round even with the
//! budget used up.
//!
//! A fatal error stops the worker. Requests still queued, and every later
//! one, fail with [`CoreError::ChannelStopped`].

mod command;

pub use command::ChannelStatistics;
pub(crate) use command::{Command, ExportPiece, LoadRequest, Reply};

use crate::cache::{EntityCache, StoragePosition};
use crate::error::{CoreError, CoreResult};
use crate::file::FileManager;
use crate::gc::MarkMonitor;
use crate::record::{ByteOrder, ChunkBuffer};
use crate::types::{ChannelIndex, ObjectId};
use command::ForwardingSink;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Commands a channel buffers before senders block.
const INBOX_CAPACITY: usize = 64;

/// Background tasks in round-robin order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HousekeepingTask {
    FileCleanup,
    Collection,
    LiveCheck,
}

const HOUSEKEEPING_TASKS: [HousekeepingTask; 3] = [
    HousekeepingTask::FileCleanup,
    HousekeepingTask::Collection,
    HousekeepingTask::LiveCheck,
];

/// Rolling time budget for housekeeping: `budget` per `interval`.
#[derive(Debug)]
struct HousekeepingSchedule {
    interval: Duration,
    budget: Duration,
    window_start: Instant,
    used: Duration,
    next: usize,
}

impl HousekeepingSchedule {
    fn new(interval: Duration, budget: Duration, now: Instant) -> Self {
        Self {
            interval,
            budget,
            window_start: now,
            used: Duration::ZERO,
            next: 0,
        }
    }

    /// Budget left in the window containing `now`, opening a new window if
    /// the current one has passed.
    fn remaining(&mut self, now: Instant) -> Duration {
        if now.saturating_duration_since(self.window_start) >= self.interval {
            self.window_start = now;
            self.used = Duration::ZERO;
        }
        self.budget.saturating_sub(self.used)
    }

    fn charge(&mut self, spent: Duration) {
        self.used += spent;
    }

    /// How long the worker may block before the next window opens.
    fn wait_time(&self, now: Instant) -> Duration {
        (self.window_start + self.interval).saturating_duration_since(now)
    }

    fn next_task(&mut self) -> HousekeepingTask {
        let task = HOUSEKEEPING_TASKS[self.next];
        self.next = (self.next + 1) % HOUSEKEEPING_TASKS.len();
        task
    }
}

#[derive(Debug)]
struct PendingStore {
    chunk: ChunkBuffer,
    positions: Vec<StoragePosition>,
}

/// Timing settings of a channel worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub(crate) housekeeping_interval: Duration,
    pub(crate) housekeeping_budget: Duration,
    pub(crate) byte_order: ByteOrder,
}

/// The state a channel's thread owns.
#[derive(Debug)]
pub(crate) struct ChannelWorker {
    channel: ChannelIndex,
    cache: EntityCache,
    files: FileManager,
    monitor: Arc<MarkMonitor>,
    byte_order: ByteOrder,
    schedule: HousekeepingSchedule,
    pending: Option<PendingStore>,
}

impl ChannelWorker {
    pub(crate) fn new(
        cache: EntityCache,
        files: FileManager,
        monitor: Arc<MarkMonitor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            channel: cache.channel(),
            cache,
            files,
            monitor,
            byte_order: settings.byte_order,
            schedule: HousekeepingSchedule::new(
                settings.housekeeping_interval,
                settings.housekeeping_budget,
                Instant::now(),
            ),
            pending: None,
        }
    }

    fn run(mut self, inbox: Receiver<Command>, running: Arc<AtomicBool>, stopped: Arc<AtomicBool>) {
        debug!(channel = %self.channel, "channel worker started");
        while running.load(Ordering::Acquire) {
            let disrupted = match inbox.recv_timeout(self.schedule.wait_time(Instant::now())) {
                Ok(Command::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if disrupted || self.housekeep() {
                stopped.store(true, Ordering::Release);
                for command in inbox.try_iter() {
                    command.refuse(CoreError::ChannelStopped {
                        channel: self.channel,
                    });
                }
                return;
            }
        }
        if self.files.has_pending_write() {
            if let Err(error) = self.files.rollback_write() {
                warn!(channel = %self.channel, %error, "rollback on shutdown failed");
            }
        }
        debug!(channel = %self.channel, "channel worker stopped");
    }

    /// Sends `result` and reports whether it carries a fatal error.
    fn respond<T>(&self, reply: Reply<T>, result: CoreResult<T>) -> bool {
        let fatal = match &result {
            Err(error) if error.is_fatal() => {
                error!(channel = %self.channel, %error, "channel disrupted");
                true
            }
            _ => false,
        };
        // The requester may have stopped waiting.
        let _ = reply.send(result);
        fatal
    }

    /// Runs one command. Returns `true` if it disrupted the channel.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Write {
                timestamp,
                chunk,
                reply,
            } => {
                // Rejected before anything is written: the channel's state is intact.
                if let Err(error) = self.cache.validate_chunk(&chunk) {
                    debug!(channel = %self.channel, %error, "store rejected");
                    let _ = reply.send(Err(error));
                    return false;
                }
                let result = self.write(timestamp, chunk);
                self.respond(reply, result)
            }
            Command::Finish { commit, reply } => {
                let result = self.finish(commit);
                self.monitor.clear_pending_store_update(self.channel);
                self.respond(reply, result)
            }
            Command::Load { request, reply } => {
                if let LoadRequest::Oids(oids) = &request {
                    if let Some(missing) = oids.iter().find(|&&oid| self.cache.get_entry(oid).is_none()) {
                        let error = CoreError::consistency(self.channel, format!("{missing} is not stored"));
                        let _ = reply.send(Err(error));
                        return false;
                    }
                }
                let result = self.load(request);
                self.respond(reply, result)
            }
            Command::RootCandidate { reply } => {
                let _ = reply.send(Ok(self.cache.root_candidate()));
                false
            }
            Command::CollectGarbage {
                deadline,
                epoch,
                reply,
            } => {
                let result = self
                    .cache
                    .issued_garbage_collection(&mut self.files, deadline, epoch);
                self.respond(reply, result)
            }
            Command::CheckFiles { deadline, reply } => {
                let result = self.file_cleanup(deadline);
                self.respond(reply, result)
            }
            Command::CheckCache {
                deadline,
                evaluator,
                reply,
            } => {
                let complete = self.cache.issued_cache_check(deadline, evaluator.as_ref());
                let _ = reply.send(Ok(complete));
                false
            }
            Command::Export { pieces } => {
                let result = self.export(&pieces);
                let fatal = matches!(&result, Err(error) if error.is_fatal());
                let _ = pieces.send(ExportPiece::Finished(result));
                fatal
            }
            Command::Statistics { reply } => {
                let _ = reply.send(Ok(self.statistics()));
                false
            }
            Command::Shutdown => false,
        }
    }

    fn write(&mut self, timestamp: u64, chunk: ChunkBuffer) -> CoreResult<Vec<StoragePosition>> {
        if self.pending.is_some() {
            return Err(CoreError::consistency(self.channel, "a store is already pending"));
        }
        let positions = self.files.store_chunks(timestamp, &chunk)?;
        self.pending = Some(PendingStore {
            chunk,
            positions: positions.clone(),
        });
        Ok(positions)
    }

    fn finish(&mut self, commit: bool) -> CoreResult<()> {
        let Some(pending) = self.pending.take() else {
            // A write that failed halfway may have left bytes behind.
            return self.files.rollback_write();
        };
        if !commit {
            return self.files.rollback_write();
        }
        self.files.commit_write()?;
        self.cache
            .post_store_put_entities(&mut self.files, &pending.chunk, &pending.positions)
    }

    fn load(&mut self, request: LoadRequest) -> CoreResult<ChunkBuffer> {
        let mut chunk = ChunkBuffer::new(self.byte_order);
        match request {
            LoadRequest::Oids(oids) => self
                .cache
                .collect_load_by_oids(&self.files, &oids, &mut chunk)?,
            LoadRequest::Types(types) => self
                .cache
                .collect_load_by_tids(&self.files, &types, &mut chunk)?,
            LoadRequest::Roots => self.cache.collect_load_roots(&self.files, &mut chunk)?,
        }
        Ok(chunk)
    }

    fn file_cleanup(&mut self, deadline: Instant) -> CoreResult<bool> {
        let cache = &mut self.cache;
        self.files
            .incremental_file_cleanup(deadline, |slot, position| cache.relocate(slot, position))
    }

    fn export(&mut self, pieces: &Sender<ExportPiece>) -> CoreResult<()> {
        if self.pending.is_some() {
            return Err(CoreError::consistency(self.channel, "export during a pending store"));
        }
        let mut sink = ForwardingSink {
            channel: self.channel,
            pieces: pieces.clone(),
        };
        self.files.export_data(&mut sink)
    }

    fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            channel: self.channel,
            cache: self.cache.statistics(),
            files: self.files.statistics(),
            head_file: self.files.head_file(),
            latest_store_timestamp: self.files.latest_store_timestamp(),
        }
    }

    /// Spends the remaining budget of the current window on background
    /// tasks. Returns `true` if a fatal error disrupted the channel.
    fn housekeep(&mut self) -> bool {
        // Index and head file must not move under a pending store.
        if self.pending.is_some() {
            return false;
        }
        if self.files.has_pending_write() {
            if let Err(error) = self.files.rollback_write() {
                warn!(channel = %self.channel, %error, "retried rollback failed");
                return false;
            }
        }
        let start = Instant::now();
        let deadline = start + self.schedule.remaining(start);
        let mut complete_in_a_row = 0;
        loop {
            let task = self.schedule.next_task();
            let result = match task {
                HousekeepingTask::FileCleanup => self.file_cleanup(deadline),
                HousekeepingTask::Collection => self.cache.incremental_gc(&mut self.files, deadline),
                HousekeepingTask::LiveCheck => Ok(self.cache.incremental_live_check(deadline)),
            };
            match result {
                Ok(true) => complete_in_a_row += 1,
                Ok(false) => complete_in_a_row = 0,
                Err(error) if error.is_fatal() => {
                    error!(channel = %self.channel, ?task, %error, "channel disrupted during housekeeping");
                    return true;
                }
                Err(error) => {
                    warn!(channel = %self.channel, ?task, %error, "housekeeping task failed");
                    complete_in_a_row = 0;
                }
            }
            if complete_in_a_row >= HOUSEKEEPING_TASKS.len() || Instant::now() >= deadline {
                break;
            }
        }
        self.schedule.charge(start.elapsed());
        false
    }
}

/// The database's side of a channel worker.
#[derive(Debug)]
pub(crate) struct ChannelHandle {
    channel: ChannelIndex,
    inbox: Sender<Command>,
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    /// Starts the worker's thread.
    pub(crate) fn spawn(worker: ChannelWorker) -> CoreResult<Self> {
        let channel = worker.channel;
        let (inbox, receiver) = bounded(INBOX_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let stopped = Arc::new(AtomicBool::new(false));
        let thread = {
            let running = Arc::clone(&running);
            let stopped = Arc::clone(&stopped);
            thread::Builder::new()
                .name(format!("graphstore-channel-{}", channel.0))
                .spawn(move || worker.run(receiver, running, stopped))?
        };
        Ok(Self {
            channel,
            inbox,
            running,
            stopped,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn channel(&self) -> ChannelIndex {
        self.channel
    }

    /// Whether the worker stopped after a fatal error.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stopped_error(&self) -> CoreError {
        CoreError::ChannelStopped {
            channel: self.channel,
        }
    }

    pub(crate) fn send(&self, command: Command) -> CoreResult<()> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }
        self.inbox.send(command).map_err(|_| self.stopped_error())
    }

    /// Sends the command built around a fresh reply slot and returns the
    /// slot's receiving end.
    pub(crate) fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> CoreResult<Receiver<CoreResult<T>>> {
        let (reply, receiver) = bounded(1);
        self.send(command(reply))?;
        Ok(receiver)
    }

    /// Waits for the answer to a [`request`](Self::request).
    pub(crate) fn wait<T>(&self, receiver: &Receiver<CoreResult<T>>) -> CoreResult<T> {
        receiver.recv().map_err(|_| self.stopped_error())?
    }

    /// Sends a request and waits for its answer.
    pub(crate) fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> CoreResult<T> {
        let receiver = self.request(command)?;
        self.wait(&receiver)
    }

    /// Stops the worker and waits for its thread.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.inbox.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(channel = %self.channel, "channel worker panicked");
            }
        }
    }
}

/// Asks every channel for its local root candidate, in channel order.
pub(crate) fn collect_root_candidates(channels: &[ChannelHandle]) -> CoreResult<Vec<Option<ObjectId>>> {
    let receivers = channels
        .iter()
        .map(|handle| handle.request(|reply| Command::RootCandidate { reply }))
        .collect::<CoreResult<Vec<_>>>()?;
    channels
        .iter()
        .zip(&receivers)
        .map(|(handle, receiver)| handle.wait(receiver))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheContext;
    use crate::file::{ChannelInventory, FileContext, InMemoryFileProvider};
    use crate::policy::{
        DefaultCacheEvaluator, DefaultFileEvaluator, EvictAll, FailOnZombies, HighestRootOid,
    };
    use crate::record::RecordBuilder;
    use crate::stats::StorageStats;
    use crate::type_dictionary::{TypeDescriptor, TypeDictionary};
    use crate::types::{ChannelLayout, Interrupts, TimestampProvider, TypeId};

    const ROOT: TypeId = TypeId(1);
    const LEAF: TypeId = TypeId(2);

    fn start(interval: Duration) -> (ChannelHandle, Arc<MarkMonitor>) {
        let layout = ChannelLayout::new(1).unwrap();
        let monitor = Arc::new(MarkMonitor::new(layout, Arc::new(HighestRootOid)));
        let stats = Arc::new(StorageStats::new());
        let types = TypeDictionary::new()
            .with(TypeDescriptor::fixed(ROOT, "Root", vec![0]))
            .with(TypeDescriptor::leaf(LEAF, "Leaf"));
        let cache = EntityCache::new(CacheContext {
            channel: ChannelIndex(0),
            types: Arc::new(types),
            root_type: Some(ROOT),
            monitor: Arc::clone(&monitor),
            zombie_handler: Arc::new(FailOnZombies),
            cache_evaluator: Arc::new(DefaultCacheEvaluator::default()),
            stats: Arc::clone(&stats),
            byte_order: ByteOrder::Little,
            mark_batch_size: 16,
            mark_buffer_length: 4,
            marking_wait_time: Duration::from_millis(1),
            interrupts: Arc::new(Interrupts::new()),
        });
        let context = FileContext {
            channel: ChannelIndex(0),
            provider: Arc::new(InMemoryFileProvider::new()),
            evaluator: Arc::new(DefaultFileEvaluator::default()),
            timestamps: Arc::new(TimestampProvider::new()),
            stats,
            byte_order: ByteOrder::Little,
            sync_on_write: false,
        };
        let (files, _) = ChannelInventory::read(&context)
            .unwrap()
            .recover(context, 0, |_, _| Ok(None))
            .unwrap();
        let worker = ChannelWorker::new(
            cache,
            files,
            Arc::clone(&monitor),
            WorkerSettings {
                housekeeping_interval: interval,
                housekeeping_budget: Duration::from_millis(1),
                byte_order: ByteOrder::Little,
            },
        );
        (ChannelHandle::spawn(worker).unwrap(), monitor)
    }

    fn store(handle: &ChannelHandle, monitor: &MarkMonitor, timestamp: u64, records: &[Vec<u8>]) -> CoreResult<()> {
        let chunk = ChunkBuffer::from_bytes(records.concat(), ByteOrder::Little).unwrap();
        monitor.register_pending_store_update(ChannelIndex(0));
        let written = handle.call(|reply| Command::Write {
            timestamp,
            chunk,
            reply,
        });
        handle.call(|reply| Command::Finish {
            commit: written.is_ok(),
            reply,
        })?;
        written.map(|_| ())
    }

    fn leaf(oid: u64) -> Vec<u8> {
        RecordBuilder::new(LEAF, ObjectId(oid))
            .raw(b"leaf")
            .build(ByteOrder::Little)
    }

    fn root(oid: u64, child: u64) -> Vec<u8> {
        RecordBuilder::new(ROOT, ObjectId(oid))
            .reference(ObjectId(child))
            .build(ByteOrder::Little)
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn schedule_rolls_budget_per_window() {
        let start = Instant::now();
        let mut schedule = HousekeepingSchedule::new(
            Duration::from_millis(100),
            Duration::from_millis(10),
            start,
        );
        assert_eq!(schedule.remaining(start), Duration::from_millis(10));
        schedule.charge(Duration::from_millis(25));
        assert_eq!(schedule.remaining(start), Duration::ZERO);
        assert_eq!(schedule.wait_time(start), Duration::from_millis(100));

        let later = start + Duration::from_millis(150);
        assert_eq!(schedule.remaining(later), Duration::from_millis(10));
        assert_eq!(schedule.wait_time(later), Duration::from_millis(100));
    }

    #[test]
    fn schedule_round_robins_tasks() {
        let mut schedule =
            HousekeepingSchedule::new(Duration::from_secs(1), Duration::ZERO, Instant::now());
        let tasks: Vec<_> = (0..4).map(|_| schedule.next_task()).collect();
        assert_eq!(
            tasks,
            vec![
                HousekeepingTask::FileCleanup,
                HousekeepingTask::Collection,
                HousekeepingTask::LiveCheck,
                HousekeepingTask::FileCleanup,
            ]
        );
    }

    #[test]
    fn store_load_and_statistics() {
        let (handle, monitor) = start(Duration::from_secs(60));
        store(&handle, &monitor, 1, &[leaf(5), leaf(6)]).unwrap();

        let chunk = handle
            .call(|reply| Command::Load {
                request: LoadRequest::Oids(vec![ObjectId(6)]),
                reply,
            })
            .unwrap();
        assert_eq!(chunk.as_bytes(), leaf(6).as_slice());

        let stats = handle.call(|reply| Command::Statistics { reply }).unwrap();
        assert_eq!(stats.cache.entity_count, 2);
        assert_eq!(stats.latest_store_timestamp, 1);
        assert_eq!(stats.files[0].entity_count, 2);
        handle.shutdown();
    }

    #[test]
    fn rejected_store_keeps_channel_running() {
        let (handle, monitor) = start(Duration::from_secs(60));
        store(&handle, &monitor, 1, &[leaf(5)]).unwrap();
        let changed = RecordBuilder::new(ROOT, ObjectId(5)).word(0).build(ByteOrder::Little);
        assert!(matches!(
            store(&handle, &monitor, 2, &[changed]),
            Err(CoreError::Consistency { .. })
        ));

        let missing = handle.call(|reply| Command::Load {
            request: LoadRequest::Oids(vec![ObjectId(77)]),
            reply,
        });
        assert!(matches!(missing, Err(CoreError::Consistency { .. })));
        assert!(!handle.is_stopped());
        assert_eq!(monitor.snapshot().pending_store_updates, 0);
        handle.shutdown();
    }

    #[test]
    fn issued_collection_and_cache_check() {
        let (handle, monitor) = start(Duration::from_secs(60));
        store(&handle, &monitor, 1, &[root(1, 2), leaf(2), leaf(3)]).unwrap();
        let complete = handle
            .call(|reply| Command::CollectGarbage {
                deadline: far(),
                epoch: 0,
                reply,
            })
            .unwrap();
        assert!(complete);
        let stats = handle.call(|reply| Command::Statistics { reply }).unwrap();
        assert_eq!(stats.cache.entity_count, 2);

        let _ = handle
            .call(|reply| Command::Load {
                request: LoadRequest::Roots,
                reply,
            })
            .unwrap();
        let flushed = handle
            .call(|reply| Command::CheckCache {
                deadline: far(),
                evaluator: Arc::new(EvictAll),
                reply,
            })
            .unwrap();
        assert!(flushed);
        let stats = handle.call(|reply| Command::Statistics { reply }).unwrap();
        assert_eq!(stats.cache.cached_bytes, 0);
        handle.shutdown();
    }

    #[test]
    fn fatal_error_stops_channel() {
        let (handle, monitor) = start(Duration::from_secs(60));
        store(&handle, &monitor, 1, &[root(1, 99)]).unwrap();
        let result = handle.call(|reply| Command::CollectGarbage {
            deadline: far(),
            epoch: 0,
            reply,
        });
        // Background marking may hit the zombie first.
        assert!(matches!(
            result,
            Err(CoreError::ZombieObjectId { .. } | CoreError::ChannelStopped { .. })
        ));

        let after = handle.call(|reply| Command::Statistics { reply });
        assert!(matches!(after, Err(CoreError::ChannelStopped { .. })));
        assert!(handle.is_stopped());
        handle.shutdown();
    }

    #[test]
    fn housekeeping_collects_in_background() {
        let (handle, monitor) = start(Duration::from_millis(5));
        store(&handle, &monitor, 1, &[root(1, 0), leaf(2)]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !monitor.is_cold_complete() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(monitor.is_cold_complete());
        let stats = handle.call(|reply| Command::Statistics { reply }).unwrap();
        assert_eq!(stats.cache.entity_count, 1);
        handle.shutdown();
    }
}
