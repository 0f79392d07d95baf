use std::fmt;

use serde::{Deserialize, Serialize};

/// One interval snapshot. Throughputs are operations per second as fixed-point
/// x100 integers; latencies are microseconds.
///
/// `combine` sums the additive fields and takes the maximum of the latency
/// bounds, which keeps it commutative and associative with `default()` as
/// the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub operation_count: u64,
    pub interval_throughput_x100: u64,
    pub total_throughput_x100: u64,
    /// Upper bound of the per-source 99.9th percentile.
    pub latency_p999_us: u64,
    pub latency_max_us: u64,
    pub latency_sum_us: u64,
    pub latency_samples: u64,
}

impl PerformanceStats {
    #[must_use]
    pub const fn combine(self, other: Self) -> Self {
        Self {
            operation_count: self.operation_count.saturating_add(other.operation_count),
            interval_throughput_x100: self
                .interval_throughput_x100
                .saturating_add(other.interval_throughput_x100),
            total_throughput_x100: self
                .total_throughput_x100
                .saturating_add(other.total_throughput_x100),
            latency_p999_us: max_u64(self.latency_p999_us, other.latency_p999_us),
            latency_max_us: max_u64(self.latency_max_us, other.latency_max_us),
            latency_sum_us: self.latency_sum_us.saturating_add(other.latency_sum_us),
            latency_samples: self.latency_samples.saturating_add(other.latency_samples),
        }
    }

    #[must_use]
    pub const fn latency_avg_us(&self) -> u64 {
        match self.latency_sum_us.checked_div(self.latency_samples) {
            Some(avg) => avg,
            None => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

const fn max_u64(left: u64, right: u64) -> u64 {
    if left >= right { left } else { right }
}

impl fmt::Display for PerformanceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops={} throughput={}.{:02}/s total={}.{:02}/s avg={}us p99.9={}us max={}us",
            self.operation_count,
            self.interval_throughput_x100 / 100,
            self.interval_throughput_x100 % 100,
            self.total_throughput_x100 / 100,
            self.total_throughput_x100 % 100,
            self.latency_avg_us(),
            self.latency_p999_us,
            self.latency_max_us
        )
    }
}
