use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::address::AddressLevel;
use crate::error::RegistryError;
use crate::registry::ComponentRegistry;

use super::{Failure, FailureType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The worker was flagged with `IgnoreWorkerFailure`.
    Ignored,
    Recorded {
        /// Tests that moved to `FAILED` because of this failure.
        failed_tests: Vec<u32>,
        worker_removed: bool,
    },
}

/// Coordinator-side sink for every Failure that reaches the root.
pub struct FailureCollector {
    registry: ComponentRegistry,
    failures: Mutex<Vec<Failure>>,
    ignored: Mutex<u64>,
}

impl FailureCollector {
    #[must_use]
    pub fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry,
            failures: Mutex::new(Vec::new()),
            ignored: Mutex::new(0),
        }
    }

    /// Records `failure`, fails the tests it affects and, for process
    /// failures, removes the worker (or the whole agent). Repeated reports
    /// for an already removed member only add to the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry rejects an update.
    pub fn record(&self, failure: Failure) -> Result<FailureDisposition, RegistryError> {
        let mut registry = self.registry.clone();
        let ignored = failure.member.level() == AddressLevel::Worker
            && registry
                .worker(&failure.member)
                .is_some_and(|worker| worker.ignore_failures);
        if ignored {
            info!("Ignored failure: {}", failure);
            let mut count = self.ignored.lock().unwrap_or_else(PoisonError::into_inner);
            *count = count.saturating_add(1);
            return Ok(FailureDisposition::Ignored);
        }
        warn!("Failure reported: {}", failure);

        let affected: Vec<u32> = match (failure.test_index, failure.failure_type) {
            (Some(test_index), FailureType::WorkerException) => vec![test_index],
            (_, FailureType::AgentUnreachable) => registry
                .workers()
                .iter()
                .filter(|worker| worker.address.agent_index() == failure.member.agent_index())
                .flat_map(|worker| registry.active_tests_of(&worker.address))
                .collect(),
            _ => registry.active_tests_of(&failure.member),
        };
        let detail = failure.to_string();
        let mut failed_tests = Vec::new();
        for test_index in affected {
            match registry.fail_test(test_index, &detail) {
                Ok(true) => failed_tests.push(test_index),
                Ok(false) => {}
                // Failures can name a test the coordinator never submitted.
                Err(RegistryError::UnknownTest { index }) => {
                    warn!("Failure references unknown test {}", index);
                }
                Err(err) => return Err(err),
            }
        }
        failed_tests.sort_unstable();
        failed_tests.dedup();

        let worker_removed = if failure.failure_type == FailureType::AgentUnreachable {
            let agent_index = failure.member.agent_index();
            let known = registry.agent(agent_index).is_some();
            registry.remove_agent(agent_index);
            known
        } else if failure.failure_type.is_process_failure() {
            registry.remove_worker(&failure.member).is_some()
        } else {
            false
        };

        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
        Ok(FailureDisposition::Recorded {
            failed_tests,
            worker_removed,
        })
    }

    #[must_use]
    pub fn failures(&self) -> Vec<Failure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn ignored_count(&self) -> u64 {
        *self.ignored.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Failure counts per type, for the run summary.
    #[must_use]
    pub fn counts_by_type(&self) -> BTreeMap<FailureType, usize> {
        let mut counts = BTreeMap::new();
        for failure in self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            let count: &mut usize = counts.entry(failure.failure_type).or_default();
            *count = count.saturating_add(1);
        }
        counts
    }
}
