use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};

use crate::address::SimulatorAddress;

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Distributed load-test orchestrator: a coordinator drives tests through phases on workers spawned by per-machine agents."
)]
pub struct FleetArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Fleet config (TOML/JSON). Falls back to ./fleetsim.toml, then ./fleetsim.json
    #[arg(long, global = true, env = "FLEETSIM_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose logging (sets log level to debug unless overridden by FLEETSIM_LOG/RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Disable color output
    #[arg(
        long = "no-color",
        global = true,
        env = "NO_COLOR",
        value_parser = BoolishValueParser::new()
    )]
    pub no_color: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Connect to the configured agents and run the test suite
    Coordinator,
    /// Serve one fleet node: accept the coordinator and spawn workers
    Agent(AgentArgs),
    /// Run one worker process (started by an agent)
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Clone)]
pub struct AgentArgs {
    /// Agent index (overrides agent.index from the config file)
    #[arg(long)]
    pub index: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Worker address, e.g. A1_W2
    #[arg(long)]
    pub address: SimulatorAddress,

    /// Endpoint of the parent agent (host:port)
    #[arg(long)]
    pub agent: String,

    /// Worker directory for marker and output files
    #[arg(long)]
    pub home: PathBuf,
}
