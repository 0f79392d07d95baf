use thiserror::Error;

use crate::phases::TestPhase;

/// Error raised by user test logic inside a lifecycle hook.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TestFailure {
    pub message: String,
}

impl TestFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Test {test_index} cannot enter {requested:?}; expected {expected:?}.")]
    InvalidTransition {
        test_index: u32,
        requested: TestPhase,
        expected: Option<TestPhase>,
    },
    #[error("Test {test_index} is still running {running:?}.")]
    PhaseInProgress { test_index: u32, running: TestPhase },
    #[error("Test {test_index} already exists on this worker.")]
    DuplicateTest { test_index: u32 },
    #[error("Test {test_index} is unknown on this worker.")]
    UnknownTest { test_index: u32 },
    #[error("Failed to create test '{test_id}': {source}")]
    CreateTest {
        test_id: String,
        #[source]
        source: TestFailure,
    },
    #[error("Failed to spawn run thread for test {test_index}: {source}")]
    SpawnThread {
        test_index: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("No workers available for test '{test_id}'.")]
    NoParticipants { test_id: String },
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
