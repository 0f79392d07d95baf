use thiserror::Error;

use super::{
    AddressError, ConfigError, ConnectionError, CorrelationError, PhaseError, ProcessError,
    ProtocolError, RegistryError, RoutingError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
    #[error("Unreachable agents: {agents}")]
    AgentsUnreachable { agents: String },
    #[error("Failed to create workers: {details}")]
    WorkerCreation { details: String },
    #[error("Run completed with {failed} failed test(s).")]
    RunCompletedWithErrors { failed: usize },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn address<E>(error: E) -> Self
    where
        E: Into<AddressError>,
    {
        error.into().into()
    }

    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn protocol<E>(error: E) -> Self
    where
        E: Into<ProtocolError>,
    {
        error.into().into()
    }

    pub fn connection<E>(error: E) -> Self
    where
        E: Into<ConnectionError>,
    {
        error.into().into()
    }

    pub fn routing<E>(error: E) -> Self
    where
        E: Into<RoutingError>,
    {
        error.into().into()
    }

    pub fn registry<E>(error: E) -> Self
    where
        E: Into<RegistryError>,
    {
        error.into().into()
    }

    pub fn phase<E>(error: E) -> Self
    where
        E: Into<PhaseError>,
    {
        error.into().into()
    }

    pub fn process<E>(error: E) -> Self
    where
        E: Into<ProcessError>,
    {
        error.into().into()
    }
}
