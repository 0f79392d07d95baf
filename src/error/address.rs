use thiserror::Error;

use crate::address::AddressLevel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Root address has no parent.")]
    RootHasNoParent,
    #[error("Test address {address} cannot have children.")]
    TestHasNoChildren { address: String },
    #[error("Index at level {level:?} must be >= 1.")]
    ZeroIndex { level: AddressLevel },
    #[error("Index at level {level:?} must be 0 for a {own:?} address (got {value}).")]
    UnexpectedIndex {
        level: AddressLevel,
        own: AddressLevel,
        value: u32,
    },
    #[error("Unknown address level code {code}.")]
    UnknownLevel { code: i8 },
    #[error("Invalid address '{value}'.")]
    Parse { value: String },
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
