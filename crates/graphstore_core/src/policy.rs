//! Pluggable policies consulted by the engine.
//!
//! - [`EntityCacheEvaluator`]: should an entity's cached bytes be dropped?
//! - [`DataFileEvaluator`]: when does a file retire, when is it dissolved?
//! - [`ZombieOidHandler`]: what happens when marking reaches a missing id?
//! - [`RootOidSelector`]: which root-typed object is the graph root?

use crate::error::{CoreError, CoreResult};
use crate::types::{ChannelIndex, ObjectId};
use std::fmt;
use tracing::warn;

/// Cache state of one entity, as seen by an [`EntityCacheEvaluator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCandidate {
    /// Bytes currently cached for the entity.
    pub cached_length: u64,
    /// Millisecond timestamp of the last load or store.
    pub last_touched_ms: u64,
    /// Whether the entity's type carries references.
    pub has_references: bool,
}

/// Decides which cached entity payloads to evict.
pub trait EntityCacheEvaluator: Send + Sync + fmt::Debug {
    /// Returns `true` if `candidate`'s cached bytes should be dropped.
    ///
    /// `used_cache_size` is the channel's total cached bytes and `now_ms`
    /// the evaluation time.
    fn clear_entity_cache(&self, used_cache_size: u64, now_ms: u64, candidate: &CacheCandidate)
        -> bool;
}

/// Age and size weighted eviction.
///
/// An entry is evicted once it is older than the timeout, or when the
/// remaining headroom under the threshold is smaller than its size
/// weighted by age. Leaf entities weigh twice as much as entities with
/// references, since the latter are likely to be needed again for marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultCacheEvaluator {
    /// Entries untouched for this long are always evicted.
    pub timeout_ms: u64,
    /// Soft byte budget for cached payloads.
    pub threshold: u64,
}

impl Default for DefaultCacheEvaluator {
    fn default() -> Self {
        Self {
            timeout_ms: 86_400_000,
            threshold: 1_000_000_000,
        }
    }
}

impl EntityCacheEvaluator for DefaultCacheEvaluator {
    fn clear_entity_cache(
        &self,
        used_cache_size: u64,
        now_ms: u64,
        candidate: &CacheCandidate,
    ) -> bool {
        let age = now_ms.saturating_sub(candidate.last_touched_ms);
        if age >= self.timeout_ms {
            return true;
        }
        let headroom = i128::from(self.threshold) - i128::from(used_cache_size);
        let shift = if candidate.has_references { 0 } else { 1 };
        let weight = (i128::from(candidate.cached_length) * i128::from(age >> 16)) << shift;
        headroom < weight
    }
}

/// Evicts every cached payload. Useful for an explicit full cache flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictAll;

impl EntityCacheEvaluator for EvictAll {
    fn clear_entity_cache(&self, _: u64, _: u64, _: &CacheCandidate) -> bool {
        true
    }
}

/// Size and usage figures of one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileUsage {
    /// Committed length in bytes.
    pub total_length: u64,
    /// Bytes occupied by live entities.
    pub data_length: u64,
    /// Number of live entities.
    pub entity_count: u64,
    /// Whether this is the channel's current write target.
    pub is_head: bool,
}

/// Decides file retirement and compaction.
pub trait DataFileEvaluator: Send + Sync + fmt::Debug {
    /// Upper bound for a file's length. A store never starts in a head
    /// file at or above it, and transfers never grow a file past it.
    fn maximum_file_size(&self) -> u64;

    /// Returns `true` if the file should be dissolved.
    fn needs_dissolving(&self, usage: &FileUsage) -> bool;

    /// Size above which the transactions log is compacted.
    fn transaction_file_maximum_size(&self) -> u64;

    /// Returns `true` if a head file of `total_length` must be retired
    /// before the next write.
    fn needs_retirement(&self, total_length: u64) -> bool {
        total_length >= self.maximum_file_size()
    }
}

/// Size and use-ratio based compaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultFileEvaluator {
    /// Non-head files below this size are dissolved.
    pub minimum_file_size: u64,
    /// Head files retire at this size.
    pub maximum_file_size: u64,
    /// Files whose live fraction drops below this are dissolved.
    pub minimum_use_ratio: f64,
    /// Whether the head file itself may be dissolved.
    pub cleanup_head_file: bool,
    /// Transactions log compaction threshold.
    pub transaction_file_maximum_size: u64,
}

impl Default for DefaultFileEvaluator {
    fn default() -> Self {
        Self {
            minimum_file_size: 1024 * 1024,
            maximum_file_size: 8 * 1024 * 1024,
            minimum_use_ratio: 0.75,
            cleanup_head_file: true,
            transaction_file_maximum_size: 100 * 1024 * 1024,
        }
    }
}

impl DataFileEvaluator for DefaultFileEvaluator {
    fn maximum_file_size(&self) -> u64 {
        self.maximum_file_size
    }

    fn needs_dissolving(&self, usage: &FileUsage) -> bool {
        if usage.total_length == 0 || (usage.is_head && !self.cleanup_head_file) {
            return false;
        }
        if !usage.is_head && usage.total_length < self.minimum_file_size {
            return true;
        }
        if (usage.data_length as f64) / (usage.total_length as f64) < self.minimum_use_ratio {
            return true;
        }
        // A single oversized entity with no dead space cannot be helped.
        let single_gapless = usage.entity_count == 1 && usage.data_length == usage.total_length;
        usage.total_length > self.maximum_file_size && !single_gapless
    }

    fn transaction_file_maximum_size(&self) -> u64 {
        self.transaction_file_maximum_size
    }
}

/// Policy for object ids that marking cannot resolve.
pub trait ZombieOidHandler: Send + Sync + fmt::Debug {
    /// Handles `oid`, unresolvable in `channel`.
    ///
    /// # Errors
    ///
    /// Returning an error stops the marking channel.
    fn handle_zombie(&self, channel: ChannelIndex, oid: ObjectId) -> CoreResult<()>;
}

/// Logs and ignores zombie ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreZombies;

impl ZombieOidHandler for IgnoreZombies {
    fn handle_zombie(&self, channel: ChannelIndex, oid: ObjectId) -> CoreResult<()> {
        warn!(%channel, %oid, "marking reached an object id that is not stored");
        Ok(())
    }
}

/// Escalates zombie ids to [`CoreError::ZombieObjectId`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FailOnZombies;

impl ZombieOidHandler for FailOnZombies {
    fn handle_zombie(&self, _channel: ChannelIndex, oid: ObjectId) -> CoreResult<()> {
        Err(CoreError::ZombieObjectId { oid })
    }
}

/// Chooses the graph root among the channels' root candidates.
pub trait RootOidSelector: Send + Sync + fmt::Debug {
    /// Returns the root, or `None` if no channel reported one.
    fn select_root(&self, channel_roots: &[Option<ObjectId>]) -> Option<ObjectId>;
}

/// The highest object id wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestRootOid;

impl RootOidSelector for HighestRootOid {
    fn select_root(&self, channel_roots: &[Option<ObjectId>]) -> Option<ObjectId> {
        channel_roots
            .iter()
            .flatten()
            .copied()
            .filter(|oid| !oid.is_null())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(total: u64, data: u64, count: u64, is_head: bool) -> FileUsage {
        FileUsage {
            total_length: total,
            data_length: data,
            entity_count: count,
            is_head,
        }
    }

    #[test]
    fn cache_evaluator_times_out() {
        let evaluator = DefaultCacheEvaluator {
            timeout_ms: 1000,
            threshold: u64::MAX,
        };
        let candidate = CacheCandidate {
            cached_length: 10,
            last_touched_ms: 0,
            has_references: true,
        };
        assert!(!evaluator.clear_entity_cache(0, 999, &candidate));
        assert!(evaluator.clear_entity_cache(0, 1000, &candidate));
    }

    #[test]
    fn cache_evaluator_weighs_leaves_double() {
        let evaluator = DefaultCacheEvaluator {
            timeout_ms: u64::MAX,
            threshold: 1_000,
        };
        let age_units = 1u64 << 16;
        let mut candidate = CacheCandidate {
            cached_length: 300,
            last_touched_ms: 0,
            has_references: true,
        };
        // headroom 500: refs weigh 300, leaves weigh 600
        assert!(!evaluator.clear_entity_cache(500, age_units, &candidate));
        candidate.has_references = false;
        assert!(evaluator.clear_entity_cache(500, age_units, &candidate));
        // over budget evicts even fresh entries
        assert!(!evaluator.clear_entity_cache(1_000, 0, &candidate));
        assert!(evaluator.clear_entity_cache(1_001, 0, &candidate));
    }

    #[test]
    fn file_evaluator_rules() {
        let evaluator = DefaultFileEvaluator {
            minimum_file_size: 100,
            maximum_file_size: 1000,
            minimum_use_ratio: 0.75,
            cleanup_head_file: true,
            transaction_file_maximum_size: 10_000,
        };
        assert!(!evaluator.needs_dissolving(&usage(0, 0, 0, false)));
        assert!(evaluator.needs_dissolving(&usage(50, 50, 1, false)));
        assert!(!evaluator.needs_dissolving(&usage(50, 50, 1, true)));
        assert!(evaluator.needs_dissolving(&usage(500, 300, 3, false)));
        assert!(!evaluator.needs_dissolving(&usage(500, 400, 3, false)));
        assert!(evaluator.needs_dissolving(&usage(1500, 1500, 2, false)));
        assert!(!evaluator.needs_dissolving(&usage(1500, 1500, 1, false)));
        assert!(evaluator.needs_retirement(1000));
        assert!(!evaluator.needs_retirement(999));

        let keep_head = DefaultFileEvaluator {
            cleanup_head_file: false,
            ..evaluator
        };
        assert!(!keep_head.needs_dissolving(&usage(500, 10, 3, true)));
    }

    #[test]
    fn zombie_policies() {
        assert!(IgnoreZombies.handle_zombie(ChannelIndex(0), ObjectId(9)).is_ok());
        assert!(matches!(
            FailOnZombies.handle_zombie(ChannelIndex(0), ObjectId(9)),
            Err(CoreError::ZombieObjectId { oid: ObjectId(9) })
        ));
    }

    #[test]
    fn highest_root_wins() {
        let roots = [Some(ObjectId(8)), None, Some(ObjectId(13)), Some(ObjectId(2))];
        assert_eq!(HighestRootOid.select_root(&roots), Some(ObjectId(13)));
        assert_eq!(HighestRootOid.select_root(&[None, None]), None);
    }
}
