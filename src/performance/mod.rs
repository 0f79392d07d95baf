//! Interval throughput/latency snapshots and their fleet-wide combination.
mod aggregator;
mod probe;
mod stats;


pub use aggregator::PerformanceAggregator;
pub use probe::{LatencyProbe, PerformanceTracker, SharedProbe};
pub use stats::PerformanceStats;
