//! Requests a channel worker accepts.

use crate::cache::{CacheStatistics, StoragePosition};
use crate::error::{CoreError, CoreResult};
use crate::export::ExportSink;
use crate::file::FileStatistics;
use crate::policy::EntityCacheEvaluator;
use crate::record::ChunkBuffer;
use crate::types::{ChannelIndex, ObjectId, TypeId};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Instant;

/// Reply slot of a command.
pub(crate) type Reply<T> = Sender<CoreResult<T>>;

/// What a load asks for.
#[derive(Debug, Clone)]
pub(crate) enum LoadRequest {
    Oids(Vec<ObjectId>),
    Types(Vec<TypeId>),
    Roots,
}

/// One piece of a channel's export, in stream order.
#[derive(Debug)]
pub(crate) enum ExportPiece {
    TransactionsLog(Vec<u8>),
    DataFile(u64, Vec<u8>),
    Finished(CoreResult<()>),
}

/// Size figures of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatistics {
    /// The channel.
    pub channel: ChannelIndex,
    /// Entity cache figures.
    pub cache: CacheStatistics,
    /// Data files in chain order.
    pub files: Vec<FileStatistics>,
    /// Number of the current write target.
    pub head_file: u64,
    /// Timestamp of the latest logged store.
    pub latest_store_timestamp: u64,
}

pub(crate) enum Command {
    /// Validates and writes this channel's share of a store.
    Write {
        timestamp: u64,
        chunk: ChunkBuffer,
        reply: Reply<Vec<StoragePosition>>,
    },
    /// Commits or rolls back the pending write. A commit registers the
    /// written entities.
    Finish { commit: bool, reply: Reply<()> },
    Load {
        request: LoadRequest,
        reply: Reply<ChunkBuffer>,
    },
    RootCandidate { reply: Reply<Option<ObjectId>> },
    CollectGarbage {
        deadline: Instant,
        epoch: u64,
        reply: Reply<bool>,
    },
    CheckFiles { deadline: Instant, reply: Reply<bool> },
    CheckCache {
        deadline: Instant,
        evaluator: Arc<dyn EntityCacheEvaluator>,
        reply: Reply<bool>,
    },
    Export { pieces: Sender<ExportPiece> },
    Statistics { reply: Reply<ChannelStatistics> },
    Shutdown,
}

impl Command {
    /// Answers the command with `error` without running it.
    pub(crate) fn refuse(self, error: CoreError) {
        // A caller that gave up waiting has dropped its receiver.
        match self {
            Self::Write { reply, .. } => drop(reply.send(Err(error))),
            Self::Finish { reply, .. } => drop(reply.send(Err(error))),
            Self::Load { reply, .. } => drop(reply.send(Err(error))),
            Self::RootCandidate { reply } => drop(reply.send(Err(error))),
            Self::CollectGarbage { reply, .. }
            | Self::CheckFiles { reply, .. }
            | Self::CheckCache { reply, .. } => drop(reply.send(Err(error))),
            Self::Export { pieces } => drop(pieces.send(ExportPiece::Finished(Err(error)))),
            Self::Statistics { reply } => drop(reply.send(Err(error))),
            Self::Shutdown => {}
        }
    }
}

/// Forwards a file manager's export to the requesting thread, one file at
/// a time.
pub(crate) struct ForwardingSink {
    pub(crate) channel: ChannelIndex,
    pub(crate) pieces: Sender<ExportPiece>,
}

impl ForwardingSink {
    fn forward(&self, piece: ExportPiece) -> CoreResult<()> {
        self.pieces.send(piece).map_err(|_| CoreError::Shutdown)
    }
}

impl ExportSink for ForwardingSink {
    fn export_transactions_log(&mut self, channel: ChannelIndex, bytes: &[u8]) -> CoreResult<()> {
        debug_assert_eq!(channel, self.channel);
        self.forward(ExportPiece::TransactionsLog(bytes.to_vec()))
    }

    fn export_data_file(&mut self, channel: ChannelIndex, number: u64, bytes: &[u8]) -> CoreResult<()> {
        debug_assert_eq!(channel, self.channel);
        self.forward(ExportPiece::DataFile(number, bytes.to_vec()))
    }
}
