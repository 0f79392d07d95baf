use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

use super::PerformanceStats;

pub type SharedProbe = Arc<Mutex<LatencyProbe>>;

/// Per-thread latency recorder. The owning run thread records into it; the
/// reporter drains it once per interval.
#[derive(Debug)]
pub struct LatencyProbe {
    hist: Histogram<u64>,
    sum_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalSample {
    pub count: u64,
    pub p999_us: u64,
    pub max_us: u64,
    pub sum_us: u64,
}

impl LatencyProbe {
    /// Create an empty probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the histogram cannot be created.
    pub fn new() -> Result<Self, String> {
        let hist = Histogram::<u64>::new(3)
            .map_err(|err| format!("Failed to create histogram: {}", err))?;
        Ok(Self { hist, sum_us: 0 })
    }

    /// Record one operation's latency, measured from its scheduled start.
    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX).max(1);
        self.hist.saturating_record(micros);
        self.sum_us = self.sum_us.saturating_add(micros);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    /// Reads and clears everything recorded since the previous call.
    pub fn take_interval(&mut self) -> IntervalSample {
        let count = self.hist.len();
        let sample = if count == 0 {
            IntervalSample::default()
        } else {
            IntervalSample {
                count,
                p999_us: self.hist.value_at_quantile(0.999),
                max_us: self.hist.max(),
                sum_us: self.sum_us,
            }
        };
        self.hist.reset();
        self.sum_us = 0;
        sample
    }
}

/// Worker-side view of one test's probes.
#[derive(Debug)]
pub struct PerformanceTracker {
    probes: Vec<SharedProbe>,
    started_at: Instant,
    last_snapshot_at: Instant,
    total_operations: u64,
}

impl PerformanceTracker {
    #[must_use]
    pub fn new(started_at: Instant) -> Self {
        Self {
            probes: Vec::new(),
            started_at,
            last_snapshot_at: started_at,
            total_operations: 0,
        }
    }

    /// Create and track a probe for one run thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the histogram cannot be created.
    pub fn add_probe(&mut self) -> Result<SharedProbe, String> {
        let probe = Arc::new(Mutex::new(LatencyProbe::new()?));
        self.probes.push(probe.clone());
        Ok(probe)
    }

    /// Drains every probe into one snapshot covering `[last, now]`.
    pub fn snapshot(&mut self, now: Instant) -> PerformanceStats {
        let mut interval = IntervalSample::default();
        for probe in &self.probes {
            let Ok(mut probe) = probe.lock() else {
                continue;
            };
            let sample = probe.take_interval();
            interval.count = interval.count.saturating_add(sample.count);
            interval.sum_us = interval.sum_us.saturating_add(sample.sum_us);
            interval.p999_us = interval.p999_us.max(sample.p999_us);
            interval.max_us = interval.max_us.max(sample.max_us);
        }
        self.total_operations = self.total_operations.saturating_add(interval.count);

        let interval_ms = now.saturating_duration_since(self.last_snapshot_at).as_millis();
        let total_ms = now.saturating_duration_since(self.started_at).as_millis();
        self.last_snapshot_at = now;

        PerformanceStats {
            operation_count: self.total_operations,
            interval_throughput_x100: throughput_x100(interval.count, interval_ms),
            total_throughput_x100: throughput_x100(self.total_operations, total_ms),
            latency_p999_us: interval.p999_us,
            latency_max_us: interval.max_us,
            latency_sum_us: interval.sum_us,
            latency_samples: interval.count,
        }
    }
}

fn throughput_x100(operations: u64, elapsed_ms: u128) -> u64 {
    u128::from(operations)
        .saturating_mul(100_000)
        .checked_div(elapsed_ms)
        .map_or(0, |scaled| u64::try_from(scaled).unwrap_or(u64::MAX))
}
