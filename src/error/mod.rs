mod address;
mod app;
mod config;
mod connection;
mod correlation;
mod phase;
mod process;
mod protocol;
mod registry;
mod routing;

#[cfg(test)]
mod test_support;

pub use address::AddressError;
pub use app::{AppError, AppResult};
pub use config::ConfigError;
pub use connection::ConnectionError;
pub use correlation::CorrelationError;
pub use phase::{PhaseError, TestFailure};
pub use process::ProcessError;
pub use protocol::ProtocolError;
pub use registry::RegistryError;
pub use routing::RoutingError;
