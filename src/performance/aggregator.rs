use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::address::SimulatorAddress;

use super::PerformanceStats;

/// Latest snapshot per `(source, test)`, combined on demand.
///
/// Agents feed it with worker snapshots and forward the combination; the
/// coordinator feeds it with agent snapshots. A newer snapshot from the same
/// source replaces the previous one, so arrival order across sources does not
/// matter.
#[derive(Debug, Default)]
pub struct PerformanceAggregator {
    latest: DashMap<(SimulatorAddress, u32), PerformanceStats>,
}

impl PerformanceAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, source: SimulatorAddress, stats: &BTreeMap<u32, PerformanceStats>) {
        for (test_index, snapshot) in stats {
            self.latest.insert((source, *test_index), *snapshot);
        }
    }

    /// Drops everything reported by `source` or its descendants.
    pub fn remove_source(&self, source: &SimulatorAddress) {
        self.latest
            .retain(|(reporter, _), _| reporter != source && !source.is_ancestor_of(reporter));
    }

    pub fn remove_test(&self, test_index: u32) {
        self.latest.retain(|(_, index), _| *index != test_index);
    }

    #[must_use]
    pub fn combined(&self) -> BTreeMap<u32, PerformanceStats> {
        let mut combined: BTreeMap<u32, PerformanceStats> = BTreeMap::new();
        for entry in &self.latest {
            let (_, test_index) = *entry.key();
            let slot = combined.entry(test_index).or_default();
            *slot = slot.combine(*entry.value());
        }
        combined
    }

    #[must_use]
    pub fn combined_for(&self, test_index: u32) -> PerformanceStats {
        self.latest
            .iter()
            .filter(|entry| entry.key().1 == test_index)
            .fold(PerformanceStats::default(), |acc, entry| {
                acc.combine(*entry.value())
            })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
