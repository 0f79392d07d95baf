use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::address::SimulatorAddress;
use crate::error::ProtocolError;
use crate::protocol::{Operation, ResultCode, encode_reply};

use super::Router;

/// A decoded message addressed to this node (or to a test it hosts).
#[derive(Debug, Clone)]
pub struct Request {
    pub source: SimulatorAddress,
    pub destination: SimulatorAddress,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ResultCode,
    pub payload: Bytes,
}

impl Reply {
    #[must_use]
    pub const fn success() -> Self {
        Self {
            code: ResultCode::Success,
            payload: Bytes::new(),
        }
    }

    /// Successful reply with a JSON body; an encoding failure becomes an
    /// execution exception.
    #[must_use]
    pub fn success_with<T: Serialize>(operation: &'static str, body: &T) -> Self {
        match encode_reply(operation, body) {
            Ok(payload) => Self {
                code: ResultCode::Success,
                payload,
            },
            Err(err) => Self::exception(&err),
        }
    }

    #[must_use]
    pub fn failure(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            payload: Bytes::from(message.into()),
        }
    }

    #[must_use]
    pub fn exception(err: &dyn std::fmt::Display) -> Self {
        Self::failure(ResultCode::ExceptionDuringOperationExecution, err.to_string())
    }

    #[must_use]
    pub fn unsupported(operation: &Operation, local: SimulatorAddress) -> Self {
        Self::failure(
            ResultCode::ExceptionUnsupportedOperation,
            format!("{} does not handle {}", local, operation.name()),
        )
    }

    pub(crate) fn from_protocol_error(err: &ProtocolError) -> Self {
        Self::exception(err)
    }
}

/// Executes operations that reach their destination node. Each node kind
/// (coordinator, agent, worker) supplies one.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, router: &Arc<Router>, request: Request) -> Reply;

    /// Called for every frame that arrives from `peer`.
    fn observe(&self, _peer: SimulatorAddress) {}

    /// The link to `peer` is gone for good.
    async fn link_closed(&self, _router: &Arc<Router>, _peer: SimulatorAddress, _reason: &str) {}
}
