//! Coordinator-side record of the live fleet and the submitted tests.
//!
//! State lives in one `ArcShift` snapshot; writers clone-and-swap through
//! `rcu`, readers take the latest snapshot without locking. Agent and test
//! indices come from shared counters, so an index is never handed out twice
//! even after its entity is removed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arcshift::ArcShift;

use crate::address::{AddressLevel, SimulatorAddress};
use crate::error::RegistryError;
use crate::phases::{TestDefinition, TestPhase};
use crate::system::clock::current_time_ms;

mod entities;


pub use entities::{AgentData, CompletionStatus, TargetType, TestData, WorkerData};

#[derive(Debug, Clone, Default)]
struct Topology {
    agents: BTreeMap<u32, AgentData>,
    workers: BTreeMap<SimulatorAddress, WorkerData>,
    tests: BTreeMap<u32, TestData>,
}

#[derive(Clone)]
pub struct ComponentRegistry {
    topology: ArcShift<Topology>,
    last_agent_index: Arc<AtomicU32>,
    last_test_index: Arc<AtomicU32>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topology: ArcShift::new(Topology::default()),
            last_agent_index: Arc::new(AtomicU32::new(0)),
            last_test_index: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Registers a fleet node under the next agent index (starting at 1).
    ///
    /// # Errors
    ///
    /// Returns an error if the agent index space is exhausted.
    pub fn register_agent(
        &mut self,
        public_endpoint: &str,
        private_endpoint: Option<&str>,
        tags: BTreeMap<String, String>,
    ) -> Result<AgentData, RegistryError> {
        let index = self
            .last_agent_index
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        let address = SimulatorAddress::agent(index).map_err(|_err| RegistryError::WrongLevel {
            address: index.to_string(),
            expected: "agent",
        })?;
        let agent = AgentData {
            address,
            public_endpoint: public_endpoint.to_owned(),
            private_endpoint: private_endpoint.unwrap_or(public_endpoint).to_owned(),
            tags,
            next_worker_index: 0,
        };
        let inserted = agent.clone();
        self.topology.rcu(|current| {
            let mut next = current.clone();
            next.agents.insert(index, inserted.clone());
            next
        });
        Ok(agent)
    }

    /// Hands out the next worker index for `agent`; indices are never reused.
    ///
    /// # Errors
    ///
    /// Returns an error if `agent` is not a registered agent address.
    pub fn allocate_worker_index(&mut self, agent: &SimulatorAddress) -> Result<u32, RegistryError> {
        let agent_index = expect_level(agent, AddressLevel::Agent, "agent")?;
        let mut allocated = None;
        self.topology.rcu(|current| {
            let mut next = current.clone();
            allocated = next.agents.get_mut(&agent_index).map(|data| {
                data.next_worker_index = data.next_worker_index.saturating_add(1);
                data.next_worker_index
            });
            next
        });
        allocated.ok_or_else(|| RegistryError::UnknownAgent {
            address: agent.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the owning agent is not registered or the worker
    /// already exists.
    pub fn add_worker(&mut self, worker: WorkerData) -> Result<(), RegistryError> {
        expect_level(&worker.address, AddressLevel::Worker, "worker")?;
        let mut outcome = Ok(());
        self.topology.rcu(|current| {
            let mut next = current.clone();
            let agent_index = worker.address.agent_index();
            outcome = if !next.agents.contains_key(&agent_index) {
                Err(RegistryError::UnknownAgent {
                    address: format!("A{}", agent_index),
                })
            } else if next.workers.contains_key(&worker.address) {
                Err(RegistryError::DuplicateWorker {
                    address: worker.address.to_string(),
                })
            } else {
                next.workers.insert(worker.address, worker.clone());
                Ok(())
            };
            next
        });
        outcome
    }

    /// Removes a worker; `None` if it was already gone.
    pub fn remove_worker(&mut self, address: &SimulatorAddress) -> Option<WorkerData> {
        if !self.topology.shared_get().workers.contains_key(address) {
            return None;
        }
        let mut removed = None;
        self.topology.rcu(|current| {
            let mut next = current.clone();
            removed = next.workers.remove(address);
            next
        });
        removed
    }

    /// Removes an agent and every worker it owns. Other indices are left
    /// untouched.
    pub fn remove_agent(&mut self, agent_index: u32) -> Vec<WorkerData> {
        let mut removed = Vec::new();
        self.topology.rcu(|current| {
            let mut next = current.clone();
            next.agents.remove(&agent_index);
            let owned: Vec<SimulatorAddress> = next
                .workers
                .keys()
                .filter(|address| address.agent_index() == agent_index)
                .copied()
                .collect();
            removed = owned
                .iter()
                .filter_map(|address| next.workers.remove(address))
                .collect();
            next
        });
        removed
    }

    #[must_use]
    pub fn agent(&self, agent_index: u32) -> Option<AgentData> {
        self.topology.shared_get().agents.get(&agent_index).cloned()
    }

    #[must_use]
    pub fn agents(&self) -> Vec<AgentData> {
        self.topology.shared_get().agents.values().cloned().collect()
    }

    #[must_use]
    pub fn worker(&self, address: &SimulatorAddress) -> Option<WorkerData> {
        self.topology.shared_get().workers.get(address).cloned()
    }

    #[must_use]
    pub fn workers(&self) -> Vec<WorkerData> {
        self.topology.shared_get().workers.values().cloned().collect()
    }

    /// Workers selected by `target`, in address order.
    #[must_use]
    pub fn agents_matching(&self, target: TargetType) -> Vec<WorkerData> {
        self.topology
            .shared_get()
            .workers
            .values()
            .filter(|worker| target.matches(worker.is_member))
            .cloned()
            .collect()
    }

    pub fn touch_worker(&mut self, address: &SimulatorAddress) {
        let now = current_time_ms();
        if !self.topology.shared_get().workers.contains_key(address) {
            return;
        }
        self.topology.rcu(|current| {
            let mut next = current.clone();
            if let Some(worker) = next.workers.get_mut(address) {
                worker.last_seen_ms = now;
            }
            next
        });
    }

    /// # Errors
    ///
    /// Returns an error if the worker is not registered.
    pub fn set_ignore_failures(
        &mut self,
        address: &SimulatorAddress,
        ignore: bool,
    ) -> Result<(), RegistryError> {
        let mut found = false;
        self.topology.rcu(|current| {
            let mut next = current.clone();
            found = next
                .workers
                .get_mut(address)
                .map(|worker| worker.ignore_failures = ignore)
                .is_some();
            next
        });
        if found {
            Ok(())
        } else {
            Err(RegistryError::UnknownWorker {
                address: address.to_string(),
            })
        }
    }

    /// One line per agent (public and private endpoint) followed by its
    /// workers.
    #[must_use]
    pub fn format_addresses(&self) -> String {
        let topology = self.topology.shared_get();
        let mut lines = Vec::new();
        for agent in topology.agents.values() {
            if agent.has_distinct_private_endpoint() {
                lines.push(format!(
                    "{} public={} private={}",
                    agent.address, agent.public_endpoint, agent.private_endpoint
                ));
            } else {
                lines.push(format!("{} {}", agent.address, agent.public_endpoint));
            }
            for worker in topology
                .workers
                .values()
                .filter(|worker| worker.address.agent_index() == agent.address.agent_index())
            {
                let kind = if worker.is_member { "member" } else { "client" };
                lines.push(format!("    {} {}", worker.address, kind));
            }
        }
        let mut output = lines.join("\n");
        if !output.is_empty() {
            output.push('\n');
        }
        output
    }

    pub fn add_test(&mut self, definition: TestDefinition) -> TestData {
        let test_index = self
            .last_test_index
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        let test = TestData {
            test_index,
            definition,
            phase: None,
            started_at_ms: None,
            status: CompletionStatus::InProgress,
            stop_requested: false,
            failure: None,
            failure_count: 0,
            workers: Vec::new(),
        };
        let inserted = test.clone();
        self.topology.rcu(|current| {
            let mut next = current.clone();
            next.tests.insert(test_index, inserted.clone());
            next
        });
        test
    }

    #[must_use]
    pub fn test(&self, test_index: u32) -> Option<TestData> {
        self.topology.shared_get().tests.get(&test_index).cloned()
    }

    #[must_use]
    pub fn tests(&self) -> Vec<TestData> {
        self.topology.shared_get().tests.values().cloned().collect()
    }

    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn set_test_workers(
        &mut self,
        test_index: u32,
        workers: Vec<SimulatorAddress>,
    ) -> Result<(), RegistryError> {
        let now = current_time_ms();
        self.update_test(test_index, |test| {
            test.workers = workers.clone();
            test.started_at_ms.get_or_insert(now);
        })
    }

    /// Removes one participant from a test, e.g. after its worker died.
    ///
    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn drop_test_worker(
        &mut self,
        test_index: u32,
        worker: &SimulatorAddress,
    ) -> Result<(), RegistryError> {
        self.update_test(test_index, |test| {
            test.workers.retain(|participant| participant != worker);
        })
    }

    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn set_test_phase(&mut self, test_index: u32, phase: TestPhase) -> Result<(), RegistryError> {
        self.update_test(test_index, |test| test.phase = Some(phase))
    }

    /// Marks the test `FAILED`. Returns true only for the call that made the
    /// transition; later failures are only counted and a `SUCCESS` test is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn fail_test(&mut self, test_index: u32, detail: &str) -> Result<bool, RegistryError> {
        let mut transitioned = false;
        self.update_test(test_index, |test| {
            transitioned = false;
            if test.status == CompletionStatus::Success {
                return;
            }
            test.failure_count = test.failure_count.saturating_add(1);
            if test.status == CompletionStatus::InProgress {
                test.status = CompletionStatus::Failed;
                test.failure = Some(detail.to_owned());
                transitioned = true;
            }
        })?;
        Ok(transitioned)
    }

    /// Ends the phase bookkeeping and moves a test that never failed to
    /// `SUCCESS`. Returns the terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn complete_test(&mut self, test_index: u32) -> Result<CompletionStatus, RegistryError> {
        let mut status = CompletionStatus::InProgress;
        self.update_test(test_index, |test| {
            if test.status == CompletionStatus::InProgress {
                test.status = CompletionStatus::Success;
            }
            test.phase = Some(TestPhase::Done);
            status = test.status;
        })?;
        Ok(status)
    }

    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn is_failed(&self, test_index: u32) -> Result<bool, RegistryError> {
        self.topology
            .shared_get()
            .tests
            .get(&test_index)
            .map(|test| test.status == CompletionStatus::Failed)
            .ok_or(RegistryError::UnknownTest { index: test_index })
    }

    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub fn request_stop(&mut self, test_index: u32) -> Result<(), RegistryError> {
        self.update_test(test_index, |test| test.stop_requested = true)
    }

    pub fn request_stop_all(&mut self) {
        self.topology.rcu(|current| {
            let mut next = current.clone();
            for test in next.tests.values_mut() {
                test.stop_requested = true;
            }
            next
        });
    }

    /// Tests that `worker` participates in whose phases are still being
    /// driven.
    #[must_use]
    pub fn active_tests_of(&self, worker: &SimulatorAddress) -> Vec<u32> {
        self.topology
            .shared_get()
            .tests
            .values()
            .filter(|test| test.phase != Some(TestPhase::Done) && test.workers.contains(worker))
            .map(|test| test.test_index)
            .collect()
    }

    fn update_test<F>(&mut self, test_index: u32, mut update: F) -> Result<(), RegistryError>
    where
        F: FnMut(&mut TestData),
    {
        let mut found = false;
        self.topology.rcu(|current| {
            let mut next = current.clone();
            found = match next.tests.get_mut(&test_index) {
                Some(test) => {
                    update(test);
                    true
                }
                None => false,
            };
            next
        });
        if found {
            Ok(())
        } else {
            Err(RegistryError::UnknownTest { index: test_index })
        }
    }
}

fn expect_level(
    address: &SimulatorAddress,
    level: AddressLevel,
    expected: &'static str,
) -> Result<u32, RegistryError> {
    if address.level() == level {
        Ok(address.own_index())
    } else {
        Err(RegistryError::WrongLevel {
            address: address.to_string(),
            expected,
        })
    }
}
