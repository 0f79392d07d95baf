//! CLI argument types.
mod cli;


pub use cli::{AgentArgs, Command, FleetArgs, WorkerArgs};
