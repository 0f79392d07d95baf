use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to connect to {peer} at {addr} after {attempts} attempts: {source}")]
    Connect {
        peer: String,
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("Handshake with {peer} timed out.")]
    HandshakeTimeout { peer: String },
    #[error("Handshake with {peer} rejected: {reason}")]
    HandshakeRejected { peer: String, reason: String },
    #[error("Connection to {peer} lost.")]
    ConnectionLost { peer: String },
    #[error("Connector already shut down.")]
    ShutDown,
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
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
