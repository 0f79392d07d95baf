//! Worker process: hosts test containers, reports performance and liveness
//! to its agent, and leaves marker files behind when something breaks.
mod builtin;
mod handler;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::address::{AddressLevel, SimulatorAddress};
use crate::config::{ConnectionSettings, WorkerSettings};
use crate::connection::{ClientConnector, ConnectorContext, event_channel};
use crate::error::{AddressError, AppError, AppResult};
use crate::failure::{ExceptionMarker, MarkerWriter};
use crate::phases::{TestFactory, panic_is_contained};
use crate::protocol::{Operation, PerformanceStateOperation};
use crate::router::Router;
use crate::system::shutdown::{ShutdownSender, request_shutdown, wait_for_shutdown};

pub use builtin::{FAIL_TEST, FailTest, NOOP_TEST, NoopTest, builtin_factory};
pub use handler::{MarkerReporter, WorkerHandler};

/// Everything a worker needs to join its agent.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub address: SimulatorAddress,
    pub agent_endpoint: String,
    pub home: PathBuf,
    pub connection: ConnectionSettings,
    pub settings: WorkerSettings,
    /// Shared with the panic hook so every marker gets its own number.
    pub markers: Arc<MarkerWriter>,
}

/// Runs one worker until shutdown is broadcast or its agent goes away.
///
/// # Errors
///
/// Returns an error if the address is not a worker address or the agent
/// cannot be reached.
pub async fn run_worker(
    launch: WorkerLaunch,
    factory: Arc<dyn TestFactory>,
    shutdown_tx: ShutdownSender,
) -> AppResult<()> {
    if launch.address.level() != AddressLevel::Worker {
        return Err(AppError::address(AddressError::WrongLevel {
            address: launch.address.to_string(),
            expected: "worker",
        }));
    }
    let agent = launch.address.parent()?;
    let mut shutdown_rx = shutdown_tx.subscribe();

    let reporter = Arc::new(MarkerReporter::new(launch.markers.clone()));
    let handler = Arc::new(WorkerHandler::new(
        launch.address,
        factory,
        reporter,
        shutdown_tx.clone(),
    ));
    let router = Router::new(
        launch.address,
        handler.clone(),
        launch.connection.response_timeout,
    );
    let (events_tx, events_rx) = event_channel();
    let router_task = tokio::spawn(router.clone().run(events_rx, shutdown_tx.subscribe()));

    let context = ConnectorContext::new(launch.address, launch.connection.clone(), events_tx);
    let connector = match ClientConnector::connect(context, agent, &launch.agent_endpoint).await {
        Ok(connector) => connector,
        Err(err) => {
            if !request_shutdown(&shutdown_tx) {
                // Router already gone.
            }
            return Err(AppError::connection(err));
        }
    };
    info!("Worker {} joined agent at {}", launch.address, launch.agent_endpoint);

    let reporter_task = tokio::spawn(report_performance(
        router.clone(),
        handler.clone(),
        agent,
        launch.settings.performance_interval,
        shutdown_tx.clone(),
    ));
    let heartbeat_task = tokio::spawn(heartbeat(
        router.clone(),
        agent,
        launch.settings.heartbeat_interval,
        shutdown_tx.clone(),
    ));

    wait_for_shutdown(&mut shutdown_rx).await;
    info!("Worker {} shutting down", launch.address);
    if !request_shutdown(&shutdown_tx) {
        // Every task already stopped.
    }
    connector.shutdown().await;
    for task in [reporter_task, heartbeat_task, router_task] {
        if let Err(err) = task.await {
            warn!("Worker task ended abnormally: {}", err);
        }
    }
    Ok(())
}

async fn report_performance(
    router: Arc<Router>,
    handler: Arc<WorkerHandler>,
    agent: SimulatorAddress,
    interval: Duration,
    shutdown_tx: ShutdownSender,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = ticker.tick() => {}
        }
        let stats = handler.snapshots();
        if stats.is_empty() {
            continue;
        }
        let operation = Operation::PerformanceState(PerformanceStateOperation { stats });
        if let Err(err) = router.call(agent, &operation).await {
            debug!("Performance report to {} failed: {}", agent, err);
        }
    }
}

async fn heartbeat(
    router: Arc<Router>,
    agent: SimulatorAddress,
    interval: Duration,
    shutdown_tx: ShutdownSender,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = ticker.tick() => {}
        }
        if let Err(err) = router.call(agent, &Operation::Ping).await {
            debug!("Heartbeat to {} failed: {}", agent, err);
        }
    }
}

/// Leaves an exception marker for panics that escape test code, then defers
/// to the previous hook. Panics caught inside a test hook are reported as
/// that test's failure instead.
pub fn install_panic_marker(writer: Arc<MarkerWriter>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if panic_is_contained() {
            previous(info);
            return;
        }
        let marker = ExceptionMarker {
            test_index: None,
            phase: None,
            message: info.to_string(),
        };
        if let Err(err) = writer.write_exception(&marker) {
            error!("Failed to write panic marker: {}", err);
        }
        previous(info);
    }));
}
