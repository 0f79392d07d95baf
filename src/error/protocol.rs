use thiserror::Error;

use super::AddressError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame length {length} is below the minimum of {min} bytes.")]
    FrameTooShort { length: usize, min: usize },
    #[error("Frame length {length} exceeds the maximum of {max} bytes.")]
    FrameTooLarge { length: usize, max: usize },
    #[error("Unknown frame kind {kind}.")]
    UnknownFrameKind { kind: u8 },
    #[error("Unknown operation type {code}.")]
    UnknownOperationType { code: i32 },
    #[error("Unknown result code {code}.")]
    UnknownResultCode { code: i32 },
    #[error("Payload length {declared} does not match frame remainder {remaining}.")]
    PayloadLengthMismatch { declared: usize, remaining: usize },
    #[error("Invalid {field} address: {source}")]
    InvalidAddress {
        field: &'static str,
        #[source]
        source: AddressError,
    },
    #[error("Failed to encode {operation} payload: {source}")]
    EncodePayload {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to decode {operation} payload: {source}")]
    DecodePayload {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on frame stream: {source}")]
    Io {
        #[from]
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
