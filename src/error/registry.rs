use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent {address} is not registered.")]
    UnknownAgent { address: String },
    #[error("Worker {address} is not registered.")]
    UnknownWorker { address: String },
    #[error("Worker {address} is already registered.")]
    DuplicateWorker { address: String },
    #[error("Test {index} is not registered.")]
    UnknownTest { index: u32 },
    #[error("Address {address} is not a {expected} address.")]
    WrongLevel {
        address: String,
        expected: &'static str,
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
