//! Process entry: parse arguments, load configuration, start the selected
//! role.
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::agent::run_agent;
use crate::args::{Command, FleetArgs, WorkerArgs};
use crate::config::types::ConfigFile;
use crate::config::{
    AgentSettings, ConnectionSettings, CoordinatorSettings, WorkerSettings, load_config,
};
use crate::coordinator::run_coordinator;
use crate::error::{AppError, AppResult};
use crate::failure::MarkerWriter;
use crate::system::logger::init_logging;
use crate::system::shutdown::{ShutdownSender, setup_signal_shutdown_handler, shutdown_channel};
use crate::worker::{WorkerLaunch, builtin_factory, install_panic_marker, run_worker};

/// Runs the command line in `std::env::args`.
///
/// # Errors
///
/// Returns an error when configuration is invalid, the selected role fails,
/// or a coordinator run ends with failed tests.
pub fn run() -> AppResult<()> {
    let args = FleetArgs::parse();
    init_logging(args.verbose, args.no_color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(args))
}

async fn run_async(args: FleetArgs) -> AppResult<()> {
    let file = load_config(args.config.as_deref())?.unwrap_or_default();
    let (shutdown_tx, _) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);

    let result = match args.command {
        Command::Coordinator => coordinate(&file, &shutdown_tx).await,
        Command::Agent(agent) => {
            let settings = AgentSettings::from_config(&file, agent.index)?;
            run_agent(settings, Arc::new(builtin_factory()), shutdown_tx.clone()).await
        }
        Command::Worker(worker) => work(&file, worker, &shutdown_tx).await,
    };
    signals.abort();
    result
}

async fn coordinate(file: &ConfigFile, shutdown_tx: &ShutdownSender) -> AppResult<()> {
    let settings = CoordinatorSettings::from_config(file)?;
    let summary = run_coordinator(settings, shutdown_tx).await?;
    if summary.is_success() {
        info!("All {} test(s) passed", summary.tests.len());
        return Ok(());
    }
    let failed = summary.failed_tests();
    warn!("{} of {} test(s) did not pass", failed, summary.tests.len());
    Err(AppError::RunCompletedWithErrors { failed })
}

async fn work(file: &ConfigFile, worker: WorkerArgs, shutdown_tx: &ShutdownSender) -> AppResult<()> {
    let markers = Arc::new(MarkerWriter::new(worker.home.clone()));
    install_panic_marker(markers.clone());
    let launch = WorkerLaunch {
        address: worker.address,
        agent_endpoint: worker.agent,
        home: worker.home,
        connection: ConnectionSettings::from_config(file.connection.as_ref())?,
        settings: WorkerSettings::from_config(file.worker.as_ref())?,
        markers,
    };
    run_worker(launch, Arc::new(builtin_factory()), shutdown_tx.clone()).await
}
