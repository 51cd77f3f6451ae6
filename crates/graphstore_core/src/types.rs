//! Identifier types shared across the engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of one persisted object.
///
/// Object id `0` is the null reference and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Creates an object id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// Identifier of a persisted type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u64);

impl TypeId {
    /// Creates a type id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Index of a channel, `0..channel_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChannelIndex(pub u32);

impl ChannelIndex {
    /// Returns the index as `usize` for slice access.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel:{}", self.0)
    }
}

/// Maps object ids onto channels.
///
/// The channel count is a power of two, so ownership is `oid & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    count: u32,
    mask: u64,
    shift: u32,
}

impl ChannelLayout {
    /// Creates a layout for `count` channels.
    ///
    /// Returns `None` unless `count` is a non-zero power of two.
    #[must_use]
    pub const fn new(count: u32) -> Option<Self> {
        if count == 0 || !count.is_power_of_two() {
            return None;
        }
        Some(Self {
            count,
            mask: count as u64 - 1,
            shift: count.trailing_zeros(),
        })
    }

    /// Number of channels.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.count
    }

    /// `count - 1`.
    #[must_use]
    pub const fn mask(self) -> u64 {
        self.mask
    }

    /// Returns the channel owning `oid`.
    #[must_use]
    pub const fn channel_of(self, oid: ObjectId) -> ChannelIndex {
        ChannelIndex((oid.0 & self.mask) as u32)
    }

    /// Hash of `oid` within its channel. The channel bits carry no
    /// information there, so they are shifted out.
    #[must_use]
    pub const fn local_hash(self, oid: ObjectId) -> u64 {
        oid.0 >> self.shift
    }

    /// Iterates all channel indices.
    pub fn channels(self) -> impl Iterator<Item = ChannelIndex> {
        (0..self.count).map(ChannelIndex)
    }
}

/// Hands out strictly increasing nanosecond timestamps.
///
/// Shared by every channel so log entries written by one store carry the
/// same timestamp everywhere and later entries never go backwards, even if
/// the wall clock does.
#[derive(Debug, Default)]
pub struct TimestampProvider {
    last: AtomicU64,
}

impl TimestampProvider {
    /// Creates a provider that has issued nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp greater than every previously issued or
    /// [`observe`](Self::observe)d one.
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Raises the floor so later timestamps exceed `timestamp`.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// Cooperative cancellation of issued, blocking operations.
///
/// Callers remember the [`epoch`](Self::epoch) when they issue an
/// operation; [`interrupt`](Self::interrupt) aborts every operation issued
/// before it, and nothing issued later.
#[derive(Debug, Default)]
pub struct Interrupts {
    epoch: AtomicU64,
}

impl Interrupts {
    /// Creates a counter with no interrupt recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Interrupts every operation issued so far.
    pub fn interrupt(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether an interrupt happened since `epoch` was read.
    #[must_use]
    pub fn interrupted_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_requires_power_of_two() {
        assert!(ChannelLayout::new(0).is_none());
        assert!(ChannelLayout::new(3).is_none());
        let layout = ChannelLayout::new(4).unwrap();
        assert_eq!(layout.mask(), 3);
        assert_eq!(layout.channels().count(), 4);
    }

    #[test]
    fn channel_of_uses_low_bits() {
        let layout = ChannelLayout::new(4).unwrap();
        assert_eq!(layout.channel_of(ObjectId(42)), ChannelIndex(2));
        assert_eq!(layout.channel_of(ObjectId(43)), ChannelIndex(3));
        assert_eq!(layout.local_hash(ObjectId(42)), 10);

        let single = ChannelLayout::new(1).unwrap();
        assert_eq!(single.channel_of(ObjectId(u64::MAX)), ChannelIndex(0));
        assert_eq!(single.local_hash(ObjectId(7)), 7);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let provider = TimestampProvider::new();
        provider.observe(u64::MAX / 2);
        let first = provider.next();
        let second = provider.next();
        assert!(first > u64::MAX / 2);
        assert!(second > first);
    }

    #[test]
    fn interrupts_only_affect_earlier_epochs() {
        let interrupts = Interrupts::new();
        let before = interrupts.epoch();
        assert!(!interrupts.interrupted_since(before));
        interrupts.interrupt();
        assert!(interrupts.interrupted_since(before));
        assert!(!interrupts.interrupted_since(interrupts.epoch()));
    }

    #[test]
    fn display_forms() {
        assert_eq!(ObjectId(5).to_string(), "oid:5");
        assert_eq!(TypeId(7).to_string(), "tid:7");
        assert_eq!(ChannelIndex(1).to_string(), "channel:1");
        assert!(ObjectId::NULL.is_null());
    }
}
