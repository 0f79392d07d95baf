//! Pacing for worker run loops.
//!
//! A metronome hands out start timestamps at a fixed interval. With
//! coordinated-omission accounting the timestamp is the scheduled slot even
//! when the caller is late, so latency measured against it includes the time
//! the operation spent queued behind a slow predecessor. Without it the
//! timestamp is the actual time the call returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetronomeKind {
    /// No pacing.
    #[default]
    None,
    Sleeping,
    BusySpinning,
    /// One schedule shared by all run threads of a test.
    ConstantCombinedRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeSettings {
    pub kind: MetronomeKind,
    /// Per-thread interval, or the interval of the whole pool for
    /// `ConstantCombinedRate`.
    pub interval_us: u64,
    pub account_for_coordinated_omission: bool,
}

impl Default for MetronomeSettings {
    fn default() -> Self {
        Self {
            kind: MetronomeKind::None,
            interval_us: 0,
            account_for_coordinated_omission: true,
        }
    }
}

impl MetronomeSettings {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }
}

pub trait Metronome: Send {
    /// Blocks until the next slot and returns its start timestamp.
    fn wait_for_next(&mut self) -> Instant;
}

/// Returns immediately; used when no rate is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyMetronome;

impl Metronome for EmptyMetronome {
    fn wait_for_next(&mut self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    Park,
    Spin,
}

impl WaitStrategy {
    fn wait_until(self, deadline: Instant) {
        match self {
            WaitStrategy::Park => loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::park_timeout(deadline.saturating_duration_since(now));
            },
            WaitStrategy::Spin => {
                while Instant::now() < deadline {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// Single-thread metronome; `Park` is the sleeping variant, `Spin` the
/// busy-spinning one.
#[derive(Debug)]
pub struct IntervalMetronome {
    interval: Duration,
    strategy: WaitStrategy,
    account_for_coordinated_omission: bool,
    next: Option<Instant>,
}

impl IntervalMetronome {
    #[must_use]
    pub const fn new(
        interval: Duration,
        strategy: WaitStrategy,
        account_for_coordinated_omission: bool,
    ) -> Self {
        Self {
            interval,
            strategy,
            account_for_coordinated_omission,
            next: None,
        }
    }

    #[must_use]
    pub const fn sleeping(interval: Duration, account_for_coordinated_omission: bool) -> Self {
        Self::new(interval, WaitStrategy::Park, account_for_coordinated_omission)
    }

    #[must_use]
    pub const fn busy_spinning(interval: Duration, account_for_coordinated_omission: bool) -> Self {
        Self::new(interval, WaitStrategy::Spin, account_for_coordinated_omission)
    }
}

impl Metronome for IntervalMetronome {
    fn wait_for_next(&mut self) -> Instant {
        let scheduled = match self.next {
            Some(next) => next,
            None => later(Instant::now(), random_offset(self.interval)),
        };
        self.strategy.wait_until(scheduled);

        if self.account_for_coordinated_omission {
            self.next = Some(later(scheduled, self.interval));
            return scheduled;
        }
        let now = Instant::now();
        let following = later(scheduled, self.interval);
        // Late callers restart the grid instead of bursting to catch up.
        self.next = Some(if following > now {
            following
        } else {
            later(now, self.interval)
        });
        now
    }
}

fn later(instant: Instant, delay: Duration) -> Instant {
    instant.checked_add(delay).unwrap_or(instant)
}

/// Schedule shared by a pool of threads. Slots are claimed with a CAS on the
/// offset of the next slot, and only once they are due.
#[derive(Debug)]
pub struct SharedSchedule {
    epoch: Instant,
    next_offset_ns: AtomicU64,
    interval_ns: u64,
}

impl SharedSchedule {
    #[must_use]
    pub fn new(interval: Duration) -> Arc<Self> {
        let offset = random_offset(interval);
        Arc::new(Self {
            epoch: Instant::now(),
            next_offset_ns: AtomicU64::new(duration_ns(offset)),
            interval_ns: duration_ns(interval).max(1),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConstantCombinedRateMetronome {
    schedule: Arc<SharedSchedule>,
    strategy: WaitStrategy,
    account_for_coordinated_omission: bool,
}

impl ConstantCombinedRateMetronome {
    #[must_use]
    pub const fn new(
        schedule: Arc<SharedSchedule>,
        strategy: WaitStrategy,
        account_for_coordinated_omission: bool,
    ) -> Self {
        Self {
            schedule,
            strategy,
            account_for_coordinated_omission,
        }
    }
}

impl Metronome for ConstantCombinedRateMetronome {
    fn wait_for_next(&mut self) -> Instant {
        let schedule = &self.schedule;
        loop {
            let offset = schedule.next_offset_ns.load(Ordering::Acquire);
            let slot = later(schedule.epoch, Duration::from_nanos(offset));
            let now = Instant::now();
            if now < slot {
                self.strategy.wait_until(slot);
                continue;
            }
            let claimed = schedule.next_offset_ns.compare_exchange(
                offset,
                offset.saturating_add(schedule.interval_ns),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_ok() {
                return if self.account_for_coordinated_omission {
                    slot
                } else {
                    now
                };
            }
        }
    }
}

/// One metronome per run thread.
#[must_use]
pub fn build_metronomes(settings: &MetronomeSettings, threads: usize) -> Vec<Box<dyn Metronome>> {
    let interval = settings.interval();
    let account = settings.account_for_coordinated_omission;
    let mut metronomes: Vec<Box<dyn Metronome>> = Vec::with_capacity(threads);
    if interval.is_zero() {
        for _ in 0..threads {
            metronomes.push(Box::new(EmptyMetronome));
        }
        return metronomes;
    }
    match settings.kind {
        MetronomeKind::None => {
            for _ in 0..threads {
                metronomes.push(Box::new(EmptyMetronome));
            }
        }
        MetronomeKind::Sleeping => {
            for _ in 0..threads {
                metronomes.push(Box::new(IntervalMetronome::sleeping(interval, account)));
            }
        }
        MetronomeKind::BusySpinning => {
            for _ in 0..threads {
                metronomes.push(Box::new(IntervalMetronome::busy_spinning(interval, account)));
            }
        }
        MetronomeKind::ConstantCombinedRate => {
            let schedule = SharedSchedule::new(interval);
            for _ in 0..threads {
                metronomes.push(Box::new(ConstantCombinedRateMetronome::new(
                    schedule.clone(),
                    WaitStrategy::Park,
                    account,
                )));
            }
        }
    }
    metronomes
}

fn random_offset(interval: Duration) -> Duration {
    let interval_ns = duration_ns(interval);
    if interval_ns == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..interval_ns))
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
