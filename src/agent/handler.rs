use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::address::{AddressLevel, SimulatorAddress};
use crate::config::{ConnectionSettings, WorkerSettings};
use crate::error::{AppError, ProcessError};
use crate::failure::{Failure, FailureMonitor, FailureSink};
use crate::performance::PerformanceAggregator;
use crate::protocol::{CreateWorkerOperation, Operation, ResultCode, WorkerCreated};
use crate::router::{OperationHandler, Reply, Request, Router};

use super::launcher::{WorkerLauncher, WorkerSpawn, prepare_worker_directory};

const WORKER_CONNECT_POLL: Duration = Duration::from_millis(20);

/// Static agent-side inputs for every worker spawn.
#[derive(Debug, Clone)]
pub struct SpawnSettings {
    pub workers_home: PathBuf,
    /// Endpoint workers dial to reach this agent.
    pub agent_endpoint: String,
    pub worker_start_timeout: Duration,
    pub connection: ConnectionSettings,
}

/// Executes coordinator requests on an agent and collects worker reports.
pub struct AgentHandler {
    address: SimulatorAddress,
    launcher: Arc<dyn WorkerLauncher>,
    monitor: Arc<FailureMonitor>,
    aggregator: Arc<PerformanceAggregator>,
    spawn: SpawnSettings,
}

impl AgentHandler {
    #[must_use]
    pub fn new(
        address: SimulatorAddress,
        launcher: Arc<dyn WorkerLauncher>,
        monitor: Arc<FailureMonitor>,
        aggregator: Arc<PerformanceAggregator>,
        spawn: SpawnSettings,
    ) -> Self {
        Self {
            address,
            launcher,
            monitor,
            aggregator,
            spawn,
        }
    }

    async fn create_worker(&self, router: &Arc<Router>, create: &CreateWorkerOperation) -> Reply {
        let address = match self.address.child(create.worker_index) {
            Ok(address) => address,
            Err(err) => return Reply::failure(ResultCode::FailureInvalidAddress, err.to_string()),
        };
        if self.monitor.worker(&address).is_some() {
            return Reply::exception(&format!("Worker {} already exists", address));
        }
        let directory = match prepare_worker_directory(&self.spawn.workers_home, address) {
            Ok(directory) => directory,
            Err(err) => return Reply::exception(&err),
        };
        let spawn = WorkerSpawn {
            address,
            directory: directory.clone(),
            agent_endpoint: self.spawn.agent_endpoint.clone(),
            connection: self.spawn.connection.clone(),
            settings: WorkerSettings {
                performance_interval: Duration::from_millis(create.performance_interval_ms.max(1)),
                heartbeat_interval: Duration::from_millis(create.heartbeat_interval_ms.max(1)),
            },
        };
        let process = match self.launcher.launch(&spawn).await {
            Ok(process) => process,
            Err(err) => {
                warn!("Failed to start worker {}: {}", address, err);
                return Reply::exception(&err);
            }
        };
        let worker = self.monitor.supervise(address, directory, Some(process));

        if let Err(err) = self.await_connection(router, address).await {
            self.monitor.request_termination(&address);
            self.monitor.release(&address);
            warn!("{}", err);
            return Reply::exception(&err);
        }
        info!(
            "Worker {} connected (member={}, pid={:?})",
            address,
            create.is_member,
            worker.pid()
        );
        Reply::success_with("create_worker", &WorkerCreated { pid: worker.pid() })
    }

    async fn await_connection(
        &self,
        router: &Router,
        address: SimulatorAddress,
    ) -> Result<(), AppError> {
        let timeout = self.spawn.worker_start_timeout;
        let waited = tokio::time::timeout(timeout, async {
            while router.link(&address).is_none() {
                tokio::time::sleep(WORKER_CONNECT_POLL).await;
            }
        })
        .await;
        waited.map_err(|_err| {
            AppError::process(ProcessError::StartTimeout {
                address: address.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        })
    }

    fn worker_address(&self, worker_index: u32) -> Result<SimulatorAddress, Reply> {
        let address = self
            .address
            .child(worker_index)
            .map_err(|err| Reply::failure(ResultCode::FailureInvalidAddress, err.to_string()))?;
        if self.monitor.worker(&address).is_none() {
            return Err(Reply::failure(
                ResultCode::FailureWorkerNotFound,
                format!("{} is not supervised by {}", address, self.address),
            ));
        }
        Ok(address)
    }
}

#[async_trait]
impl OperationHandler for AgentHandler {
    async fn handle(&self, router: &Arc<Router>, request: Request) -> Reply {
        match &request.operation {
            Operation::CreateWorker(create) => self.create_worker(router, create).await,
            Operation::TerminateWorker(target) => match self.worker_address(target.worker_index) {
                Ok(address) => {
                    self.monitor.request_termination(&address);
                    self.aggregator.remove_source(&address);
                    Reply::success()
                }
                Err(reply) => reply,
            },
            Operation::IgnoreWorkerFailure(target) => {
                match self.worker_address(target.worker_index) {
                    Ok(address) => {
                        self.monitor.ignore_failures(&address);
                        info!("Failures of {} will be ignored", address);
                        Reply::success()
                    }
                    Err(reply) => reply,
                }
            }
            Operation::StartTimeoutDetection => {
                self.monitor.start_timeout_detection();
                Reply::success()
            }
            Operation::StopTimeoutDetection => {
                self.monitor.stop_timeout_detection();
                Reply::success()
            }
            Operation::PerformanceState(state) if request.source.level() == AddressLevel::Worker => {
                self.aggregator.update(request.source, &state.stats);
                Reply::success()
            }
            other @ (Operation::Identify
            | Operation::Ping
            | Operation::CreateTest(_)
            | Operation::StartTestPhase(_)
            | Operation::IsPhaseCompleted(_)
            | Operation::StopTest
            | Operation::Failure(_)
            | Operation::PerformanceState(_)) => Reply::unsupported(other, router.local()),
        }
    }

    fn observe(&self, peer: SimulatorAddress) {
        if peer.level() == AddressLevel::Worker {
            self.monitor.touch(&peer);
        }
    }

    async fn link_closed(&self, _router: &Arc<Router>, peer: SimulatorAddress, reason: &str) {
        match peer.level() {
            AddressLevel::Worker => {
                debug!("Worker {} disconnected: {}", peer, reason);
                self.aggregator.remove_source(&peer);
            }
            AddressLevel::Root => info!("Coordinator disconnected: {}", reason),
            AddressLevel::Agent | AddressLevel::Test => {}
        }
    }
}

/// Sends monitor findings to the coordinator.
pub struct CoordinatorSink {
    router: Arc<Router>,
}

impl CoordinatorSink {
    #[must_use]
    pub const fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl FailureSink for CoordinatorSink {
    async fn report(&self, failure: Failure) {
        let failure_type = failure.failure_type;
        let member = failure.member;
        let operation = Operation::Failure(Box::new(failure));
        if let Err(err) = self
            .router
            .call(SimulatorAddress::coordinator(), &operation)
            .await
        {
            warn!(
                "Could not report {} of {} to the coordinator: {}",
                failure_type, member, err
            );
        }
    }
}
