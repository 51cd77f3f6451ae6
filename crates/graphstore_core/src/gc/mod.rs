//! Cross-channel garbage collection coordination.
//!
//! Each channel collects its own entities, but reachability crosses
//! channels. The pieces here connect the local collectors:
//!
//! - [`OidMarkQueue`]: ids waiting to be marked by one channel
//! - [`MarkMonitor`]: global pending-mark count, sweep scheduling and
//!   completion state
//! - [`ReferenceMarker`]: per-channel buffering in front of the monitor
//!
//! ## Lock Order
//!
//! The monitor lock is taken before any queue lock. A channel never holds
//! its queue lock while calling into the monitor.
//!
//! ## Invariants
//!
//! - the pending-mark count equals the summed queue lengths whenever the
//!   monitor lock is free
//! - a sweep is scheduled only when no mark is pending and no store is
//!   updating an entity index
//! - every channel sweeps exactly once per cycle

mod marker;
mod monitor;
mod queue;

pub use marker::ReferenceMarker;
pub use monitor::{MarkMonitor, MonitorSnapshot};
pub use queue::OidMarkQueue;
