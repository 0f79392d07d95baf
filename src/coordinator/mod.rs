//! Root of the hierarchy: dials every agent, provisions workers, drives each
//! test through its phases and turns the outcome into a [`RunSummary`].
mod handler;
mod summary;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::address::SimulatorAddress;
use crate::config::CoordinatorSettings;
use crate::connection::{ClientConnector, ConnectorContext, event_channel};
use crate::error::{AppError, AppResult};
use crate::failure::{Failure, FailureCollector, FailureType};
use crate::performance::PerformanceAggregator;
use crate::phases::{PhaseSettings, TestPhase, TestPhaseCoordinator};
use crate::protocol::{
    CreateWorkerOperation, Operation, WorkerCreated, WorkerIndexOperation, decode_reply,
};
use crate::registry::{AgentData, CompletionStatus, ComponentRegistry, WorkerData};
use crate::router::Router;
use crate::system::clock::{current_time_ms, deadline_after, duration_to_ms};
use crate::system::shutdown::{
    ShutdownReceiver, ShutdownSender, request_shutdown, shutdown_channel, wait_for_shutdown,
};

pub use handler::CoordinatorHandler;
pub use summary::{RunSummary, TestOutcome};

const LINK_POLL: Duration = Duration::from_millis(10);

/// Coordinator-side plumbing shared by every stage of a run.
struct Session {
    registry: ComponentRegistry,
    router: Arc<Router>,
    handler: Arc<CoordinatorHandler>,
    collector: Arc<FailureCollector>,
    aggregator: Arc<PerformanceAggregator>,
    links: Vec<ClientConnector>,
    local_tx: ShutdownSender,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn open(settings: &CoordinatorSettings) -> AppResult<(Self, ConnectorContext)> {
        let mut registry = ComponentRegistry::new();
        for endpoint in &settings.agents {
            let agent = registry.register_agent(
                &endpoint.public,
                endpoint.private.as_deref(),
                endpoint.tags.clone(),
            )?;
            debug!("Registered agent {} at {}", agent.address, agent.public_endpoint);
        }
        let collector = Arc::new(FailureCollector::new(registry.clone()));
        let aggregator = Arc::new(PerformanceAggregator::new());
        let handler = Arc::new(CoordinatorHandler::new(collector.clone(), aggregator.clone()));
        let router = Router::new(
            SimulatorAddress::coordinator(),
            handler.clone(),
            settings.connection.response_timeout,
        );
        let (local_tx, _) = shutdown_channel();
        let (events_tx, events_rx) = event_channel();
        let tasks = vec![tokio::spawn(router.clone().run(events_rx, local_tx.subscribe()))];
        let context = ConnectorContext::new(
            SimulatorAddress::coordinator(),
            settings.connection.clone(),
            events_tx,
        );
        Ok((
            Self {
                registry,
                router,
                handler,
                collector,
                aggregator,
                links: Vec::new(),
                local_tx,
                tasks,
            },
            context,
        ))
    }

    async fn close(self) {
        self.handler.begin_closing();
        for link in &self.links {
            link.shutdown().await;
        }
        if !request_shutdown(&self.local_tx) {
            // Every task already ended.
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("Coordinator task ended abnormally: {}", err);
            }
        }
    }
}

/// Runs the configured suite against the fleet and returns the summary.
/// Broadcasting on `shutdown_tx` stops the running tests early; they still
/// pass through both teardown phases.
///
/// # Errors
///
/// Returns an error if any agent is unreachable, a worker cannot be
/// created, or the registry rejects an update.
pub async fn run_coordinator(
    settings: CoordinatorSettings,
    shutdown_tx: &ShutdownSender,
) -> AppResult<RunSummary> {
    let started_at_ms = current_time_ms();
    let (mut session, context) = Session::open(&settings)?;

    match connect_agents(&context, &session.registry.agents()).await {
        Ok(links) => session.links = links,
        Err(err) => {
            session.close().await;
            return Err(err);
        }
    }
    if let Err(err) = await_links(
        &session.router,
        &session.registry.agents(),
        settings.connection.handshake_timeout,
    )
    .await
    {
        session.close().await;
        return Err(err);
    }
    if let Err(err) = create_workers(&session, &settings).await {
        session.close().await;
        return Err(err);
    }
    info!("Fleet ready:\n{}", session.registry.format_addresses());
    broadcast_to_agents(&session, &Operation::StartTimeoutDetection).await;

    let mut registry = session.registry.clone();
    let indices: Vec<u32> = settings
        .tests
        .iter()
        .map(|definition| registry.add_test(definition.clone()).test_index)
        .collect();

    let stopping = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn(watch_shutdown(
        shutdown_tx.subscribe(),
        session.registry.clone(),
        stopping.clone(),
    ));
    session.tasks.push(tokio::spawn(log_performance(
        session.registry.clone(),
        session.aggregator.clone(),
        settings.performance_interval,
        session.local_tx.subscribe(),
    )));

    if settings.parallel {
        let runs = indices
            .iter()
            .map(|test_index| run_test(&session, settings.phases, *test_index));
        join_all(runs).await;
    } else {
        for test_index in &indices {
            if stopping.load(Ordering::Acquire) {
                info!("Shutdown requested; test {} not started", test_index);
                continue;
            }
            run_test(&session, settings.phases, *test_index).await;
        }
    }
    watcher.abort();

    broadcast_to_agents(&session, &Operation::StopTimeoutDetection).await;
    session.handler.begin_closing();
    terminate_workers(&session).await;

    let summary = summarize(&session, started_at_ms);
    for line in summary.lines() {
        info!("{}", line);
    }
    session.close().await;
    Ok(summary)
}

async fn connect_agents(
    context: &ConnectorContext,
    agents: &[AgentData],
) -> AppResult<Vec<ClientConnector>> {
    let attempts = agents.iter().map(|agent| async move {
        (
            agent,
            ClientConnector::connect(context.clone(), agent.address, &agent.public_endpoint).await,
        )
    });
    let mut links = Vec::new();
    let mut unreachable = Vec::new();
    for (agent, result) in join_all(attempts).await {
        match result {
            Ok(link) => links.push(link),
            Err(err) => {
                error!("Agent {} at {} unreachable: {}", agent.address, agent.public_endpoint, err);
                unreachable.push(format!("{} ({}): {}", agent.address, agent.public_endpoint, err));
            }
        }
    }
    if unreachable.is_empty() {
        return Ok(links);
    }
    for link in &links {
        link.shutdown().await;
    }
    Err(AppError::AgentsUnreachable {
        agents: unreachable.join("; "),
    })
}

/// Waits until the router has taken over every freshly opened link.
async fn await_links(router: &Router, agents: &[AgentData], timeout: Duration) -> AppResult<()> {
    let deadline = deadline_after(timeout);
    loop {
        let missing: Vec<String> = agents
            .iter()
            .filter(|agent| router.link(&agent.address).is_none())
            .map(|agent| format!("{} ({}): link not registered", agent.address, agent.public_endpoint))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::AgentsUnreachable {
                agents: missing.join("; "),
            });
        }
        tokio::time::sleep(LINK_POLL).await;
    }
}

async fn create_workers(session: &Session, settings: &CoordinatorSettings) -> AppResult<()> {
    let agents = session.registry.agents();
    let per_agent = agents
        .iter()
        .map(|agent| create_agent_workers(session, settings, agent.address));
    let errors: Vec<String> = join_all(per_agent).await.into_iter().flatten().collect();
    if errors.is_empty() {
        return Ok(());
    }
    Err(AppError::WorkerCreation {
        details: errors.join("; "),
    })
}

/// Workers of one agent are created one after another; the first
/// `members_per_agent` of them are members.
async fn create_agent_workers(
    session: &Session,
    settings: &CoordinatorSettings,
    agent: SimulatorAddress,
) -> Vec<String> {
    let mut registry = session.registry.clone();
    let mut errors = Vec::new();
    for slot in 0..settings.workers_per_agent {
        let is_member = slot < settings.members_per_agent;
        let address = match registry
            .allocate_worker_index(&agent)
            .map_err(AppError::from)
            .and_then(|index| agent.child(index).map_err(AppError::from))
        {
            Ok(address) => address,
            Err(err) => {
                errors.push(format!("{}: {}", agent, err));
                break;
            }
        };
        let operation = Operation::CreateWorker(CreateWorkerOperation {
            worker_index: address.worker_index(),
            is_member,
            performance_interval_ms: duration_to_ms(settings.worker.performance_interval),
            heartbeat_interval_ms: duration_to_ms(settings.worker.heartbeat_interval),
        });
        let created = match session.router.call(agent, &operation).await {
            Ok(payload) => decode_reply::<WorkerCreated>("create_worker", &payload).map_err(AppError::from),
            Err(err) => Err(err),
        };
        let outcome = created.and_then(|reply| {
            registry
                .add_worker(WorkerData {
                    address,
                    is_member,
                    pid: reply.pid,
                    last_seen_ms: current_time_ms(),
                    ignore_failures: false,
                })
                .map_err(AppError::from)
        });
        match outcome {
            Ok(()) => info!("Created worker {} (member={})", address, is_member),
            Err(err) => {
                let detail = format!("{}: {}", address, err);
                let failure = Failure::new(FailureType::WorkerCreateError, address, detail.clone());
                if let Err(record_err) = session.collector.record(failure) {
                    warn!("Failed to record worker creation failure: {}", record_err);
                }
                errors.push(detail);
            }
        }
    }
    errors
}

async fn broadcast_to_agents(session: &Session, operation: &Operation) {
    let agents = session.registry.agents();
    let calls = agents.iter().map(|agent| async move {
        (agent.address, session.router.call(agent.address, operation).await)
    });
    for (agent, result) in join_all(calls).await {
        if let Err(err) = result {
            warn!("{} to {} failed: {}", operation.name(), agent, err);
        }
    }
}

async fn terminate_workers(session: &Session) {
    let workers = session.registry.workers();
    let calls = workers.iter().map(|worker| async move {
        let Ok(agent) = worker.address.parent() else {
            return;
        };
        let operation = Operation::TerminateWorker(WorkerIndexOperation {
            worker_index: worker.address.worker_index(),
        });
        if let Err(err) = session.router.call(agent, &operation).await {
            warn!("Failed to terminate {}: {}", worker.address, err);
        }
    });
    join_all(calls).await;
}

async fn run_test(session: &Session, phases: PhaseSettings, test_index: u32) {
    let Some(test) = session.registry.test(test_index) else {
        warn!("Test {} vanished from the registry", test_index);
        return;
    };
    let workers: Vec<SimulatorAddress> = session
        .registry
        .agents_matching(test.definition.target)
        .iter()
        .map(|worker| worker.address)
        .collect();
    let mut coordinator =
        TestPhaseCoordinator::new(session.router.clone(), session.registry.clone(), phases);
    match coordinator.run(test_index, &workers).await {
        Ok(CompletionStatus::Success) => {}
        Ok(status) => warn!("Test {} '{}' ended {}", test_index, test.definition.id, status),
        Err(err) => error!("Test {} '{}' aborted: {}", test_index, test.definition.id, err),
    }
}

async fn watch_shutdown(
    mut shutdown_rx: ShutdownReceiver,
    mut registry: ComponentRegistry,
    stopping: Arc<AtomicBool>,
) {
    wait_for_shutdown(&mut shutdown_rx).await;
    warn!("Shutdown requested; stopping running tests");
    stopping.store(true, Ordering::Release);
    registry.request_stop_all();
}

async fn log_performance(
    registry: ComponentRegistry,
    aggregator: Arc<PerformanceAggregator>,
    interval: Duration,
    mut shutdown_rx: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = ticker.tick() => {}
        }
        for test in registry.tests() {
            if test.phase != Some(TestPhase::Run) {
                continue;
            }
            let stats = aggregator.combined_for(test.test_index);
            if !stats.is_empty() {
                info!("Test {} '{}': {}", test.test_index, test.definition.id, stats);
            }
        }
    }
}

fn summarize(session: &Session, started_at_ms: u64) -> RunSummary {
    let tests = session
        .registry
        .tests()
        .iter()
        .map(|test| TestOutcome::from_test(test, session.aggregator.combined_for(test.test_index)))
        .collect();
    RunSummary {
        started_at_ms,
        finished_at_ms: current_time_ms(),
        tests,
        failures_by_type: session.collector.counts_by_type(),
        ignored_failures: session.collector.ignored_count(),
    }
}
