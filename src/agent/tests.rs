use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Agent, prepare_worker_directory};
use crate::address::SimulatorAddress;
use crate::config::{AgentSettings, ConnectionSettings};
use crate::connection::{ClientConnector, ConnectorContext, event_channel};
use crate::error::{AppError, AppResult};
use crate::failure::{ExceptionMarker, Failure, FailureType, MarkerWriter};
use crate::protocol::{
    CreateWorkerOperation, Operation, ResultCode, WorkerCreated, WorkerIndexOperation,
    decode_reply,
};
use crate::router::{OperationHandler, Reply, Request, Router};
use crate::system::clock::deadline_after;
use crate::system::shutdown::{ShutdownSender, shutdown_channel};
use crate::worker::builtin_factory;

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

/// Stands in for the coordinator and keeps every Failure it receives.
#[derive(Default)]
struct RecordingCoordinator {
    failures: Mutex<Vec<Failure>>,
}

impl RecordingCoordinator {
    fn failures(&self) -> Vec<Failure> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OperationHandler for RecordingCoordinator {
    async fn handle(&self, router: &Arc<Router>, request: Request) -> Reply {
        if let Operation::Failure(failure) = &request.operation {
            if let Ok(mut failures) = self.failures.lock() {
                failures.push(failure.as_ref().clone());
            }
            return Reply::success();
        }
        if matches!(request.operation, Operation::PerformanceState(_)) {
            return Reply::success();
        }
        Reply::unsupported(&request.operation, router.local())
    }
}

fn connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_attempts: 3,
        connect_retry_delay: Duration::from_millis(20),
        handshake_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
        ..ConnectionSettings::default()
    }
}

struct Harness {
    agent: Agent,
    coordinator: Arc<Router>,
    recorder: Arc<RecordingCoordinator>,
    link: ClientConnector,
    shutdown_tx: ShutdownSender,
}

impl Harness {
    async fn start(home: &Path) -> AppResult<Self> {
        let (shutdown_tx, _) = shutdown_channel();
        let mut settings = AgentSettings::with_defaults(1, home.to_path_buf());
        settings.listen = "127.0.0.1:0".to_owned();
        settings.in_process_workers = true;
        settings.failure_check_interval = Duration::from_millis(20);
        settings.worker_start_timeout = Duration::from_secs(5);
        settings.connection = connection_settings();
        let agent = Agent::start(settings, Arc::new(builtin_factory()), shutdown_tx.clone()).await?;

        let recorder = Arc::new(RecordingCoordinator::default());
        let coordinator = Router::new(
            SimulatorAddress::coordinator(),
            recorder.clone(),
            Duration::from_secs(5),
        );
        let (events_tx, events_rx) = event_channel();
        tokio::spawn(coordinator.clone().run(events_rx, shutdown_tx.subscribe()));
        let context = ConnectorContext::new(
            SimulatorAddress::coordinator(),
            connection_settings(),
            events_tx,
        );
        let link = ClientConnector::connect(
            context,
            agent.address(),
            &agent.local_addr().to_string(),
        )
        .await?;
        let harness = Self {
            agent,
            coordinator,
            recorder,
            link,
            shutdown_tx,
        };
        harness
            .wait_until("coordinator link", |harness| {
                harness.coordinator.link(&harness.agent.address()).is_some()
            })
            .await?;
        Ok(harness)
    }

    async fn create_worker(&self, worker_index: u32) -> AppResult<WorkerCreated> {
        let payload = self
            .coordinator
            .call(
                self.agent.address(),
                &Operation::CreateWorker(CreateWorkerOperation {
                    worker_index,
                    is_member: false,
                    performance_interval_ms: 50,
                    heartbeat_interval_ms: 100,
                }),
            )
            .await?;
        Ok(decode_reply("create_worker", &payload)?)
    }

    async fn wait_until(&self, what: &'static str, done: impl Fn(&Self) -> bool) -> AppResult<()> {
        let deadline = deadline_after(Duration::from_secs(5));
        while !done(self) {
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::from(what));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn stop(self) {
        self.link.shutdown().await;
        self.agent.stop().await;
        if self.shutdown_tx.send(()).is_err() {
            // Already stopped.
        }
    }
}

#[test]
fn create_worker_starts_a_connected_worker() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let harness = Harness::start(home.path()).await?;
        let worker = SimulatorAddress::worker(1, 1)?;

        let created = harness.create_worker(1).await?;
        if created.pid.is_some() {
            return Err(AppError::from("in-process worker reported a pid"));
        }
        if harness.agent.monitor().addresses() != vec![worker] {
            return Err(AppError::from("worker is not supervised"));
        }
        if harness.agent.router().link(&worker).is_none() {
            return Err(AppError::from("worker link missing on the agent"));
        }
        if !home.path().join(worker.to_string()).is_dir() {
            return Err(AppError::from("worker directory missing"));
        }

        let duplicate = harness
            .coordinator
            .request(harness.agent.address(), &Operation::CreateWorker(CreateWorkerOperation {
                worker_index: 1,
                is_member: false,
                performance_interval_ms: 50,
                heartbeat_interval_ms: 100,
            }))
            .await?;
        if duplicate.result_code != ResultCode::ExceptionDuringOperationExecution {
            return Err(AppError::from("duplicate worker index was accepted"));
        }
        harness.stop().await;
        Ok(())
    })
}

#[test]
fn terminated_worker_is_not_reported() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let harness = Harness::start(home.path()).await?;
        harness.create_worker(1).await?;

        harness
            .coordinator
            .call(
                harness.agent.address(),
                &Operation::TerminateWorker(WorkerIndexOperation { worker_index: 1 }),
            )
            .await?;
        harness
            .wait_until("worker released", |harness| harness.agent.monitor().is_empty())
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !harness.recorder.failures().is_empty() {
            return Err(AppError::from("requested termination was reported as a failure"));
        }
        harness.stop().await;
        Ok(())
    })
}

#[test]
fn exception_marker_reaches_the_coordinator() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let harness = Harness::start(home.path()).await?;
        let worker = SimulatorAddress::worker(1, 1)?;
        harness.create_worker(1).await?;

        let directory = prepare_worker_directory(home.path(), worker)?;
        MarkerWriter::new(directory).write_exception(&ExceptionMarker {
            test_index: Some(4),
            phase: Some("run".to_owned()),
            message: "boom".to_owned(),
        })?;
        harness
            .wait_until("failure forwarded", |harness| {
                !harness.recorder.failures().is_empty()
            })
            .await?;

        let failures = harness.recorder.failures();
        let Some(failure) = failures.first() else {
            return Err(AppError::from("no failure recorded"));
        };
        if failure.failure_type != FailureType::WorkerException
            || failure.member != worker
            || failure.test_index != Some(4)
            || failure.message != "boom in run"
        {
            return Err(AppError::from("unexpected failure content"));
        }
        if harness.agent.monitor().addresses() != vec![worker] {
            return Err(AppError::from("an exception must not remove the worker"));
        }
        harness.stop().await;
        Ok(())
    })
}

#[test]
fn unknown_worker_is_rejected() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let harness = Harness::start(home.path()).await?;

        let terminated = harness
            .coordinator
            .request(
                harness.agent.address(),
                &Operation::TerminateWorker(WorkerIndexOperation { worker_index: 9 }),
            )
            .await?;
        if terminated.result_code != ResultCode::FailureWorkerNotFound {
            return Err(AppError::from("terminating an unknown worker must fail"));
        }
        let ignored = harness
            .coordinator
            .request(
                harness.agent.address(),
                &Operation::IgnoreWorkerFailure(WorkerIndexOperation { worker_index: 9 }),
            )
            .await?;
        if ignored.result_code != ResultCode::FailureWorkerNotFound {
            return Err(AppError::from("ignoring an unknown worker must fail"));
        }
        harness.stop().await;
        Ok(())
    })
}

#[test]
fn timeout_detection_toggles_on_request() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let harness = Harness::start(home.path()).await?;
        let agent = harness.agent.address();

        harness
            .coordinator
            .call(agent, &Operation::StartTimeoutDetection)
            .await?;
        if !harness.agent.monitor().is_timeout_detection_enabled() {
            return Err(AppError::from("timeout detection was not enabled"));
        }
        harness
            .coordinator
            .call(agent, &Operation::StopTimeoutDetection)
            .await?;
        if harness.agent.monitor().is_timeout_detection_enabled() {
            return Err(AppError::from("timeout detection was not disabled"));
        }
        harness.stop().await;
        Ok(())
    })
}

#[test]
fn unspecified_listen_address_maps_to_loopback() -> AppResult<()> {
    let endpoint = super::worker_endpoint("0.0.0.0:7000".parse().map_err(|_err| {
        AppError::from("socket address should parse")
    })?);
    if endpoint != "127.0.0.1:7000" {
        return Err(AppError::from("unspecified address was not mapped"));
    }
    Ok(())
}
