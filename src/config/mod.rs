//! Configuration loading and resolution into runtime settings.
mod loader;
mod parse;
mod settings;
pub mod types;

#[cfg(test)]
mod tests;

pub use loader::{load_config, load_config_file, write_config_file};
pub use settings::{
    AgentEndpoint, AgentSettings, ConnectionSettings, CoordinatorSettings, WorkerSettings,
};

pub(crate) use parse::parse_duration_value;
