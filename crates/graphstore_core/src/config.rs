//! Database configuration.

use crate::error::{CoreError, CoreResult};
use crate::policy::{
    DataFileEvaluator, DefaultCacheEvaluator, DefaultFileEvaluator, EntityCacheEvaluator,
    HighestRootOid, IgnoreZombies, RootOidSelector, ZombieOidHandler,
};
use crate::record::ByteOrder;
use crate::type_dictionary::TypeDictionary;
use crate::types::{ChannelLayout, TypeId};
use std::sync::Arc;
use std::time::Duration;

/// Largest supported channel count.
pub const MAX_CHANNEL_COUNT: u32 = 1024;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the database already exists.
    pub error_if_exists: bool,

    /// Number of channels. A power of two, fixed when the database is
    /// created.
    pub channel_count: u32,

    /// Byte order of record fields.
    pub byte_order: ByteOrder,

    /// Registered type descriptors.
    pub types: TypeDictionary,

    /// Type whose instances are graph roots.
    pub root_type_id: Option<TypeId>,

    /// Non-head files smaller than this are dissolved.
    pub file_minimum_size: u64,

    /// Head files retire at this size.
    pub file_maximum_size: u64,

    /// Files whose live fraction drops below this are dissolved.
    pub minimum_use_ratio: f64,

    /// Whether the head file itself may be dissolved.
    pub cleanup_head_file: bool,

    /// The transactions log is compacted above this size.
    pub transaction_file_maximum_size: u64,

    /// Rolling housekeeping interval.
    pub housekeeping_interval: Duration,

    /// Housekeeping time allowed per interval.
    pub housekeeping_time_budget: Duration,

    /// Cached payloads untouched for this long are evicted.
    pub entity_cache_timeout: Duration,

    /// Soft byte budget for cached payloads per channel.
    pub entity_cache_threshold: u64,

    /// How long an issued GC waits for new marks before re-checking.
    pub marking_wait_time: Duration,

    /// Per-target buffer length of the reference marker.
    pub mark_buffer_length: usize,

    /// Object ids taken from the mark queue per batch.
    pub mark_batch_size: usize,

    /// Whether to fsync data before logging it and the log after.
    pub sync_on_write: bool,

    /// Zombie object id policy.
    pub zombie_handler: Arc<dyn ZombieOidHandler>,

    /// Root selection policy.
    pub root_selector: Arc<dyn RootOidSelector>,

    /// Overrides the file evaluator derived from the size settings.
    pub file_evaluator: Option<Arc<dyn DataFileEvaluator>>,

    /// Overrides the cache evaluator derived from the cache settings.
    pub cache_evaluator: Option<Arc<dyn EntityCacheEvaluator>>,
}

impl Default for Config {
    fn default() -> Self {
        let files = DefaultFileEvaluator::default();
        let cache = DefaultCacheEvaluator::default();
        Self {
            create_if_missing: true,
            error_if_exists: false,
            channel_count: 1,
            byte_order: ByteOrder::Little,
            types: TypeDictionary::new(),
            root_type_id: None,
            file_minimum_size: files.minimum_file_size,
            file_maximum_size: files.maximum_file_size,
            minimum_use_ratio: files.minimum_use_ratio,
            cleanup_head_file: files.cleanup_head_file,
            transaction_file_maximum_size: files.transaction_file_maximum_size,
            housekeeping_interval: Duration::from_secs(1),
            housekeeping_time_budget: Duration::from_millis(10),
            entity_cache_timeout: Duration::from_millis(cache.timeout_ms),
            entity_cache_threshold: cache.threshold,
            marking_wait_time: Duration::from_millis(10),
            mark_buffer_length: 100,
            mark_batch_size: 500,
            sync_on_write: true,
            zombie_handler: Arc::new(IgnoreZombies),
            root_selector: Arc::new(HighestRootOid),
            file_evaluator: None,
            cache_evaluator: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if the database exists.
    #[must_use]
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the channel count.
    #[must_use]
    pub fn channel_count(mut self, count: u32) -> Self {
        self.channel_count = count;
        self
    }

    /// Sets the record byte order.
    #[must_use]
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Sets the type dictionary.
    #[must_use]
    pub fn types(mut self, types: TypeDictionary) -> Self {
        self.types = types;
        self
    }

    /// Sets the root type.
    #[must_use]
    pub fn root_type(mut self, type_id: TypeId) -> Self {
        self.root_type_id = Some(type_id);
        self
    }

    /// Sets minimum and maximum data file sizes.
    #[must_use]
    pub fn file_sizes(mut self, minimum: u64, maximum: u64) -> Self {
        self.file_minimum_size = minimum;
        self.file_maximum_size = maximum;
        self
    }

    /// Sets the minimum live fraction of a data file.
    #[must_use]
    pub fn minimum_use_ratio(mut self, ratio: f64) -> Self {
        self.minimum_use_ratio = ratio;
        self
    }

    /// Sets whether the head file may be dissolved.
    #[must_use]
    pub fn cleanup_head_file(mut self, value: bool) -> Self {
        self.cleanup_head_file = value;
        self
    }

    /// Sets the transactions log compaction threshold.
    #[must_use]
    pub fn transaction_file_maximum_size(mut self, size: u64) -> Self {
        self.transaction_file_maximum_size = size;
        self
    }

    /// Sets the housekeeping interval and its time budget.
    #[must_use]
    pub fn housekeeping(mut self, interval: Duration, budget: Duration) -> Self {
        self.housekeeping_interval = interval;
        self.housekeeping_time_budget = budget;
        self
    }

    /// Sets the default cache evaluator's timeout and byte threshold.
    #[must_use]
    pub fn entity_cache(mut self, timeout: Duration, threshold: u64) -> Self {
        self.entity_cache_timeout = timeout;
        self.entity_cache_threshold = threshold;
        self
    }

    /// Sets how long an issued GC waits for new marks.
    #[must_use]
    pub fn marking_wait_time(mut self, wait: Duration) -> Self {
        self.marking_wait_time = wait;
        self
    }

    /// Sets whether writes are fsynced.
    #[must_use]
    pub fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the zombie object id policy.
    #[must_use]
    pub fn zombie_handler(mut self, handler: Arc<dyn ZombieOidHandler>) -> Self {
        self.zombie_handler = handler;
        self
    }

    /// Sets the root selection policy.
    #[must_use]
    pub fn root_selector(mut self, selector: Arc<dyn RootOidSelector>) -> Self {
        self.root_selector = selector;
        self
    }

    /// Replaces the file evaluator.
    #[must_use]
    pub fn file_evaluator(mut self, evaluator: Arc<dyn DataFileEvaluator>) -> Self {
        self.file_evaluator = Some(evaluator);
        self
    }

    /// Replaces the cache evaluator.
    #[must_use]
    pub fn cache_evaluator(mut self, evaluator: Arc<dyn EntityCacheEvaluator>) -> Self {
        self.cache_evaluator = Some(evaluator);
        self
    }

    /// Channel layout for the configured count.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] unless the count is a power of
    /// two within range.
    pub fn layout(&self) -> CoreResult<ChannelLayout> {
        if self.channel_count > MAX_CHANNEL_COUNT {
            return Err(CoreError::invalid_config(format!(
                "channel count {} exceeds {MAX_CHANNEL_COUNT}",
                self.channel_count
            )));
        }
        ChannelLayout::new(self.channel_count).ok_or_else(|| {
            CoreError::invalid_config(format!(
                "channel count {} is not a power of two",
                self.channel_count
            ))
        })
    }

    /// Checks settings that would make the engine misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the first bad setting.
    pub fn validate(&self) -> CoreResult<()> {
        self.layout()?;
        if self.file_maximum_size == 0 || self.file_minimum_size > self.file_maximum_size {
            return Err(CoreError::invalid_config(format!(
                "file sizes must satisfy 0 <= minimum ({}) <= maximum ({}), maximum > 0",
                self.file_minimum_size, self.file_maximum_size
            )));
        }
        if !(0.0..=1.0).contains(&self.minimum_use_ratio) {
            return Err(CoreError::invalid_config(format!(
                "minimum use ratio {} outside 0..=1",
                self.minimum_use_ratio
            )));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(CoreError::invalid_config("housekeeping interval is zero"));
        }
        if self.mark_batch_size == 0 || self.mark_buffer_length == 0 {
            return Err(CoreError::invalid_config(
                "mark batch size and mark buffer length must be positive",
            ));
        }
        if let Some(root) = self.root_type_id {
            if self.types.get(root).is_none() {
                return Err(CoreError::invalid_config(format!(
                    "root type {root} is not registered"
                )));
            }
        }
        Ok(())
    }

    /// The file evaluator in effect.
    #[must_use]
    pub fn effective_file_evaluator(&self) -> Arc<dyn DataFileEvaluator> {
        self.file_evaluator.clone().unwrap_or_else(|| {
            Arc::new(DefaultFileEvaluator {
                minimum_file_size: self.file_minimum_size,
                maximum_file_size: self.file_maximum_size,
                minimum_use_ratio: self.minimum_use_ratio,
                cleanup_head_file: self.cleanup_head_file,
                transaction_file_maximum_size: self.transaction_file_maximum_size,
            })
        })
    }

    /// The cache evaluator in effect.
    #[must_use]
    pub fn effective_cache_evaluator(&self) -> Arc<dyn EntityCacheEvaluator> {
        self.cache_evaluator.clone().unwrap_or_else(|| {
            Arc::new(DefaultCacheEvaluator {
                timeout_ms: u64::try_from(self.entity_cache_timeout.as_millis()).unwrap_or(u64::MAX),
                threshold: self.entity_cache_threshold,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CacheCandidate;
    use crate::type_dictionary::TypeDescriptor;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert_eq!(config.channel_count, 1);
        assert_eq!(config.file_maximum_size, 8 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .channel_count(4)
            .file_sizes(10, 100)
            .sync_on_write(false)
            .byte_order(ByteOrder::Big);

        assert_eq!(config.layout().unwrap().mask(), 3);
        assert_eq!(config.effective_file_evaluator().maximum_file_size(), 100);
        assert!(!config.sync_on_write);
        assert_eq!(config.byte_order, ByteOrder::Big);
    }

    #[test]
    fn huge_cache_timeout_saturates() {
        // 2^62 seconds is a multiple of 2^64 milliseconds.
        let config = Config::new().entity_cache(Duration::from_secs(1 << 62), u64::MAX);
        let fresh = CacheCandidate {
            cached_length: 8,
            last_touched_ms: 10_000,
            has_references: true,
        };
        assert!(!config
            .effective_cache_evaluator()
            .clear_entity_cache(0, 10_000, &fresh));
    }

    #[test]
    fn rejects_bad_channel_counts() {
        assert!(Config::new().channel_count(3).validate().is_err());
        assert!(Config::new().channel_count(0).validate().is_err());
        assert!(Config::new().channel_count(2048).validate().is_err());
    }

    #[test]
    fn rejects_unregistered_root_type() {
        let config = Config::new().root_type(TypeId(9));
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig { .. })));

        let config = Config::new()
            .types(TypeDictionary::new().with(TypeDescriptor::leaf(TypeId(9), "Root")))
            .root_type(TypeId(9));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_file_sizes() {
        assert!(Config::new().file_sizes(100, 10).validate().is_err());
        assert!(Config::new().minimum_use_ratio(1.5).validate().is_err());
    }
}
