use thiserror::Error;

use crate::protocol::ResultCode;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("{destination} answered {code:?}: {message}")]
    Rejected {
        destination: String,
        code: ResultCode,
        message: String,
    },
    #[error("No route from {local} to {destination}.")]
    Unroutable { local: String, destination: String },
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
