use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::address::{AddressLevel, SimulatorAddress};
use crate::error::PhaseError;
use crate::failure::{ExceptionMarker, MarkerWriter};
use crate::performance::PerformanceStats;
use crate::phases::{ExceptionReporter, TestContainer, TestDefinition, TestFactory, TestPhase};
use crate::protocol::{Operation, ResultCode};
use crate::router::{OperationHandler, Reply, Request, Router};
use crate::system::shutdown::{ShutdownSender, request_shutdown};

/// Turns hook failures into exception markers for the agent's monitor.
pub struct MarkerReporter {
    writer: Arc<MarkerWriter>,
}

impl MarkerReporter {
    #[must_use]
    pub const fn new(writer: Arc<MarkerWriter>) -> Self {
        Self { writer }
    }
}

impl ExceptionReporter for MarkerReporter {
    fn report(&self, test_index: u32, phase: TestPhase, message: &str) {
        let marker = ExceptionMarker {
            test_index: Some(test_index),
            phase: Some(phase.to_string()),
            message: message.to_owned(),
        };
        if let Err(err) = self.writer.write_exception(&marker) {
            warn!("Failed to record failure of test {}: {}", test_index, err);
        }
    }
}

/// Hosts the test containers of one worker.
pub struct WorkerHandler {
    address: SimulatorAddress,
    factory: Arc<dyn TestFactory>,
    reporter: Arc<dyn ExceptionReporter>,
    containers: DashMap<u32, TestContainer>,
    shutdown_tx: ShutdownSender,
}

impl WorkerHandler {
    #[must_use]
    pub fn new(
        address: SimulatorAddress,
        factory: Arc<dyn TestFactory>,
        reporter: Arc<dyn ExceptionReporter>,
        shutdown_tx: ShutdownSender,
    ) -> Self {
        Self {
            address,
            factory,
            reporter,
            containers: DashMap::new(),
            shutdown_tx,
        }
    }

    #[must_use]
    pub fn test_count(&self) -> usize {
        self.containers.len()
    }

    /// Interval snapshots of every test past the start of its run phase.
    #[must_use]
    pub fn snapshots(&self) -> BTreeMap<u32, PerformanceStats> {
        let now = Instant::now();
        self.containers
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .performance_snapshot(now)
                    .map(|stats| (*entry.key(), stats))
            })
            .collect()
    }

    fn create_test(&self, request: &Request, test_index: u32, definition: &TestDefinition) -> Reply {
        if request.destination != self.address {
            return Reply::failure(
                ResultCode::FailureInvalidAddress,
                format!("CreateTest must target a worker, not {}", request.destination),
            );
        }
        if self.containers.contains_key(&test_index) {
            return Reply::exception(&PhaseError::DuplicateTest { test_index });
        }
        let address = match self.address.child(test_index) {
            Ok(address) => address,
            Err(err) => return Reply::failure(ResultCode::FailureInvalidAddress, err.to_string()),
        };
        match TestContainer::new(
            address,
            definition.clone(),
            self.factory.as_ref(),
            self.reporter.clone(),
        ) {
            Ok(container) => {
                info!("{} created test '{}'", address, definition.id);
                self.containers.insert(test_index, container);
                Reply::success()
            }
            Err(err) => {
                warn!("{} could not create test '{}': {}", address, definition.id, err);
                Reply::exception(&err)
            }
        }
    }

    fn container(&self, destination: &SimulatorAddress) -> Result<TestContainer, Reply> {
        if destination.level() != AddressLevel::Test {
            return Err(Reply::failure(
                ResultCode::FailureInvalidAddress,
                format!("{} is not a test address", destination),
            ));
        }
        self.containers
            .get(&destination.test_index())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Reply::failure(
                    ResultCode::FailureTestNotFound,
                    format!("{} is not hosted here", destination),
                )
            })
    }
}

#[async_trait]
impl OperationHandler for WorkerHandler {
    async fn handle(&self, router: &Arc<Router>, request: Request) -> Reply {
        match &request.operation {
            Operation::CreateTest(create) => {
                self.create_test(&request, create.test_index, &create.definition)
            }
            Operation::StartTestPhase(start) => match self.container(&request.destination) {
                Ok(container) => match container.start_phase(start.phase, start.skip) {
                    Ok(()) => Reply::success(),
                    Err(err) => Reply::exception(&err),
                },
                Err(reply) => reply,
            },
            Operation::IsPhaseCompleted(query) => match self.container(&request.destination) {
                Ok(container) => {
                    let progress = container.progress(query.phase);
                    if query.phase == TestPhase::LocalTeardown && container.is_done() {
                        debug!("{} released test {}", self.address, container.test_index());
                        self.containers.remove(&container.test_index());
                    }
                    Reply::success_with("is_phase_completed", &progress)
                }
                Err(reply) => reply,
            },
            Operation::StopTest => match self.container(&request.destination) {
                Ok(container) => {
                    container.request_stop();
                    Reply::success()
                }
                Err(reply) => reply,
            },
            other @ (Operation::Identify
            | Operation::Ping
            | Operation::CreateWorker(_)
            | Operation::TerminateWorker(_)
            | Operation::StartTimeoutDetection
            | Operation::StopTimeoutDetection
            | Operation::IgnoreWorkerFailure(_)
            | Operation::Failure(_)
            | Operation::PerformanceState(_)) => Reply::unsupported(other, router.local()),
        }
    }

    async fn link_closed(&self, _router: &Arc<Router>, peer: SimulatorAddress, reason: &str) {
        if self.address.parent().is_ok_and(|agent| agent == peer) {
            warn!("{} lost its agent ({}); shutting down", self.address, reason);
            for entry in &self.containers {
                entry.value().request_stop();
            }
            if !request_shutdown(&self.shutdown_tx) {
                // Already shutting down.
            }
        }
    }
}
