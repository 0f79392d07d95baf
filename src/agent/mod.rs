//! Agent process: accepts the coordinator and its own workers, starts and
//! supervises worker processes, and relays their failures and performance
//! upward.
mod handler;
mod launcher;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::address::SimulatorAddress;
use crate::config::AgentSettings;
use crate::connection::{ConnectorContext, ServerConnector, event_channel};
use crate::error::{AppResult, ProcessError};
use crate::failure::FailureMonitor;
use crate::performance::PerformanceAggregator;
use crate::phases::TestFactory;
use crate::protocol::{Operation, PerformanceStateOperation};
use crate::router::Router;
use crate::system::shutdown::{ShutdownReceiver, ShutdownSender, request_shutdown, wait_for_shutdown};

pub use handler::{AgentHandler, CoordinatorSink, SpawnSettings};
pub use launcher::{
    InProcessLauncher, ProcessLauncher, WORKER_CONFIG_FILE, WorkerLauncher, WorkerSpawn,
    prepare_worker_directory,
};

/// A running agent. Dropping it does not stop the background tasks; call
/// [`Agent::stop`].
pub struct Agent {
    address: SimulatorAddress,
    local_addr: SocketAddr,
    server: ServerConnector,
    router: Arc<Router>,
    monitor: Arc<FailureMonitor>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: ShutdownSender,
}

impl Agent {
    /// Binds the listener and starts routing, failure monitoring and
    /// performance forwarding.
    ///
    /// # Errors
    ///
    /// Returns an error if the address, workers home, worker binary or
    /// listener cannot be set up.
    pub async fn start(
        settings: AgentSettings,
        factory: Arc<dyn TestFactory>,
        shutdown_tx: ShutdownSender,
    ) -> AppResult<Self> {
        let address = SimulatorAddress::agent(settings.index)?;
        std::fs::create_dir_all(&settings.workers_home).map_err(|source| {
            ProcessError::WorkerDirectory {
                path: settings.workers_home.clone(),
                source,
            }
        })?;
        let launcher: Arc<dyn WorkerLauncher> = if settings.in_process_workers {
            Arc::new(InProcessLauncher::new(factory))
        } else {
            Arc::new(ProcessLauncher::new(settings.worker_binary.clone())?)
        };

        let (events_tx, events_rx) = event_channel();
        let context = ConnectorContext::new(address, settings.connection.clone(), events_tx);
        let server = ServerConnector::bind(context, &settings.listen).await?;
        let local_addr = server.local_addr();

        let monitor = Arc::new(FailureMonitor::new(address, settings.worker_last_seen_timeout));
        let aggregator = Arc::new(PerformanceAggregator::new());
        let handler = Arc::new(AgentHandler::new(
            address,
            launcher,
            monitor.clone(),
            aggregator.clone(),
            SpawnSettings {
                workers_home: settings.workers_home.clone(),
                agent_endpoint: worker_endpoint(local_addr),
                worker_start_timeout: settings.worker_start_timeout,
                connection: settings.connection.clone(),
            },
        ));
        let router = Router::new(address, handler, settings.connection.response_timeout);

        let tasks = vec![
            tokio::spawn(router.clone().run(events_rx, shutdown_tx.subscribe())),
            tokio::spawn(monitor.clone().run(
                settings.failure_check_interval,
                Arc::new(CoordinatorSink::new(router.clone())),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(forward_performance(
                router.clone(),
                aggregator,
                settings.performance_interval,
                shutdown_tx.subscribe(),
            )),
        ];
        info!(
            "Agent {} ready on {} (workers in {})",
            address,
            local_addr,
            settings.workers_home.display()
        );
        Ok(Self {
            address,
            local_addr,
            server,
            router,
            monitor,
            tasks,
            shutdown_tx,
        })
    }

    #[must_use]
    pub const fn address(&self) -> SimulatorAddress {
        self.address
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<FailureMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Terminates every supervised worker and stops all agent tasks.
    pub async fn stop(self) {
        for worker in self.monitor.addresses() {
            self.monitor.request_termination(&worker);
            self.monitor.release(&worker);
        }
        self.server.shutdown().await;
        if !request_shutdown(&self.shutdown_tx) {
            // Nobody else listens; the tasks below hold receivers.
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("Agent task ended abnormally: {}", err);
            }
        }
        info!("Agent {} stopped", self.address);
    }
}

/// Runs an agent until shutdown is broadcast.
///
/// # Errors
///
/// Returns an error if the agent cannot start.
pub async fn run_agent(
    settings: AgentSettings,
    factory: Arc<dyn TestFactory>,
    shutdown_tx: ShutdownSender,
) -> AppResult<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let agent = Agent::start(settings, factory, shutdown_tx).await?;
    wait_for_shutdown(&mut shutdown_rx).await;
    agent.stop().await;
    Ok(())
}

/// Workers run on the same host, so an unspecified bind address is reached
/// through loopback.
fn worker_endpoint(local_addr: SocketAddr) -> String {
    if local_addr.ip().is_unspecified() {
        let loopback = match local_addr {
            SocketAddr::V4(_) => std::net::IpAddr::from([127, 0, 0, 1]),
            SocketAddr::V6(_) => std::net::IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1]),
        };
        return SocketAddr::new(loopback, local_addr.port()).to_string();
    }
    local_addr.to_string()
}

async fn forward_performance(
    router: Arc<Router>,
    aggregator: Arc<PerformanceAggregator>,
    interval: Duration,
    mut shutdown_rx: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let coordinator = SimulatorAddress::coordinator();
    loop {
        tokio::select! {
            () = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = ticker.tick() => {}
        }
        if aggregator.is_empty() || router.link(&coordinator).is_none() {
            continue;
        }
        let stats = aggregator.combined();
        let operation = Operation::PerformanceState(PerformanceStateOperation { stats });
        if let Err(err) = router.call(coordinator, &operation).await {
            debug!("Performance forward failed: {}", err);
        }
    }
}
