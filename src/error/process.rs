use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to prepare worker directory '{path}': {source}")]
    WorkerDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn worker {address}: {source}")]
    Spawn {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker {address} did not connect within {timeout_ms}ms.")]
    StartTimeout { address: String, timeout_ms: u64 },
    #[error("Failed to resolve worker binary: {source}")]
    WorkerBinary {
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write marker file '{path}': {source}")]
    WriteMarker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write worker config '{path}': {source}")]
    WriteWorkerConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
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
