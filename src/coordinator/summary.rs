use std::collections::BTreeMap;

use crate::failure::FailureType;
use crate::performance::PerformanceStats;
use crate::registry::{CompletionStatus, TestData};
use crate::system::clock::format_time_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub test_index: u32,
    pub id: String,
    pub status: CompletionStatus,
    pub failure: Option<String>,
    pub failure_count: u32,
    pub performance: PerformanceStats,
}

impl TestOutcome {
    #[must_use]
    pub fn from_test(test: &TestData, performance: PerformanceStats) -> Self {
        Self {
            test_index: test.test_index,
            id: test.definition.id.clone(),
            status: test.status,
            failure: test.failure.clone(),
            failure_count: test.failure_count,
            performance,
        }
    }
}

/// What a coordinator run produced, in test order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub tests: Vec<TestOutcome>,
    pub failures_by_type: BTreeMap<FailureType, usize>,
    pub ignored_failures: u64,
}

impl RunSummary {
    /// Tests that did not end in `SUCCESS`, including tests never started.
    #[must_use]
    pub fn failed_tests(&self) -> usize {
        self.tests
            .iter()
            .filter(|test| test.status != CompletionStatus::Success)
            .count()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed_tests() == 0
    }

    #[must_use]
    pub fn total_performance(&self) -> PerformanceStats {
        self.tests
            .iter()
            .fold(PerformanceStats::default(), |acc, test| {
                acc.combine(test.performance)
            })
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!(
            "Run summary ({} .. {}):",
            format_time_ms(self.started_at_ms),
            format_time_ms(self.finished_at_ms)
        ));
        for test in &self.tests {
            lines.push(format!(
                "  test {} '{}': {} ({})",
                test.test_index, test.id, test.status, test.performance
            ));
            if let Some(failure) = &test.failure {
                let more = test.failure_count.saturating_sub(1);
                if more > 0 {
                    lines.push(format!("    failure: {} (+{} more)", failure, more));
                } else {
                    lines.push(format!("    failure: {}", failure));
                }
            }
        }
        if self.failures_by_type.is_empty() {
            lines.push("  failures: none".to_owned());
        } else {
            let counts: Vec<String> = self
                .failures_by_type
                .iter()
                .map(|(failure_type, count)| format!("{}={}", failure_type, count))
                .collect();
            lines.push(format!("  failures: {}", counts.join(", ")));
        }
        if self.ignored_failures > 0 {
            lines.push(format!("  ignored failures: {}", self.ignored_failures));
        }
        lines.push(format!("  fleet: {}", self.total_performance()));
        lines
    }
}
