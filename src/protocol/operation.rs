use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::failure::Failure;
use crate::performance::PerformanceStats;
use crate::phases::{TestDefinition, TestPhase};

use super::types::OperationType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWorkerOperation {
    pub worker_index: u32,
    pub is_member: bool,
    pub performance_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIndexOperation {
    pub worker_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCreated {
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTestOperation {
    pub test_index: u32,
    pub definition: TestDefinition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTestPhaseOperation {
    pub phase: TestPhase,
    /// Advance the state machine without running the hook.
    pub skip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseQueryOperation {
    pub phase: TestPhase,
}

/// Answer to `IsPhaseCompleted`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub completed: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerformanceStateOperation {
    /// Latest snapshot per test index.
    pub stats: BTreeMap<u32, PerformanceStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Identify,
    Ping,
    CreateWorker(CreateWorkerOperation),
    TerminateWorker(WorkerIndexOperation),
    StartTimeoutDetection,
    StopTimeoutDetection,
    IgnoreWorkerFailure(WorkerIndexOperation),
    CreateTest(Box<CreateTestOperation>),
    StartTestPhase(StartTestPhaseOperation),
    IsPhaseCompleted(PhaseQueryOperation),
    StopTest,
    Failure(Box<Failure>),
    PerformanceState(PerformanceStateOperation),
}

impl Operation {
    #[must_use]
    pub const fn operation_type(&self) -> OperationType {
        match self {
            Operation::Identify => OperationType::Identify,
            Operation::Ping => OperationType::Ping,
            Operation::CreateWorker(_) => OperationType::CreateWorker,
            Operation::TerminateWorker(_) => OperationType::TerminateWorker,
            Operation::StartTimeoutDetection => OperationType::StartTimeoutDetection,
            Operation::StopTimeoutDetection => OperationType::StopTimeoutDetection,
            Operation::IgnoreWorkerFailure(_) => OperationType::IgnoreWorkerFailure,
            Operation::CreateTest(_) => OperationType::CreateTest,
            Operation::StartTestPhase(_) => OperationType::StartTestPhase,
            Operation::IsPhaseCompleted(_) => OperationType::IsPhaseCompleted,
            Operation::StopTest => OperationType::StopTest,
            Operation::Failure(_) => OperationType::Failure,
            Operation::PerformanceState(_) => OperationType::PerformanceState,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        operation_name(self.operation_type())
    }

    /// Serializes the operation body; unit operations have an empty payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn to_payload(&self) -> Result<Bytes, ProtocolError> {
        let name = self.name();
        match self {
            Operation::Identify
            | Operation::Ping
            | Operation::StartTimeoutDetection
            | Operation::StopTimeoutDetection
            | Operation::StopTest => Ok(Bytes::new()),
            Operation::CreateWorker(body) => encode_body(name, body),
            Operation::TerminateWorker(body) | Operation::IgnoreWorkerFailure(body) => {
                encode_body(name, body)
            }
            Operation::CreateTest(body) => encode_body(name, body.as_ref()),
            Operation::StartTestPhase(body) => encode_body(name, body),
            Operation::IsPhaseCompleted(body) => encode_body(name, body),
            Operation::Failure(body) => encode_body(name, body.as_ref()),
            Operation::PerformanceState(body) => encode_body(name, body),
        }
    }

    /// Rebuilds a typed operation from its wire type and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the operation type.
    pub fn from_payload(
        operation_type: OperationType,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        let name = operation_name(operation_type);
        let operation = match operation_type {
            OperationType::Identify => Operation::Identify,
            OperationType::Ping => Operation::Ping,
            OperationType::CreateWorker => Operation::CreateWorker(decode_body(name, payload)?),
            OperationType::TerminateWorker => {
                Operation::TerminateWorker(decode_body(name, payload)?)
            }
            OperationType::StartTimeoutDetection => Operation::StartTimeoutDetection,
            OperationType::StopTimeoutDetection => Operation::StopTimeoutDetection,
            OperationType::IgnoreWorkerFailure => {
                Operation::IgnoreWorkerFailure(decode_body(name, payload)?)
            }
            OperationType::CreateTest => {
                Operation::CreateTest(Box::new(decode_body(name, payload)?))
            }
            OperationType::StartTestPhase => {
                Operation::StartTestPhase(decode_body(name, payload)?)
            }
            OperationType::IsPhaseCompleted => {
                Operation::IsPhaseCompleted(decode_body(name, payload)?)
            }
            OperationType::StopTest => Operation::StopTest,
            OperationType::Failure => Operation::Failure(Box::new(decode_body(name, payload)?)),
            OperationType::PerformanceState => {
                Operation::PerformanceState(decode_body(name, payload)?)
            }
        };
        Ok(operation)
    }
}

const fn operation_name(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::Identify => "identify",
        OperationType::Ping => "ping",
        OperationType::CreateWorker => "create_worker",
        OperationType::TerminateWorker => "terminate_worker",
        OperationType::StartTimeoutDetection => "start_timeout_detection",
        OperationType::StopTimeoutDetection => "stop_timeout_detection",
        OperationType::IgnoreWorkerFailure => "ignore_worker_failure",
        OperationType::CreateTest => "create_test",
        OperationType::StartTestPhase => "start_test_phase",
        OperationType::IsPhaseCompleted => "is_phase_completed",
        OperationType::StopTest => "stop_test",
        OperationType::Failure => "failure",
        OperationType::PerformanceState => "performance_state",
    }
}

fn encode_body<T>(operation: &'static str, body: &T) -> Result<Bytes, ProtocolError>
where
    T: Serialize,
{
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::EncodePayload { operation, source })
}

fn decode_body<T>(operation: &'static str, payload: &[u8]) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(payload)
        .map_err(|source| ProtocolError::DecodePayload { operation, source })
}

/// Decodes a typed reply payload (e.g. `PhaseProgress`).
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON for `T`.
pub(crate) fn decode_reply<T>(operation: &'static str, payload: &[u8]) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
{
    decode_body(operation, payload)
}

/// # Errors
///
/// Returns an error if the reply cannot be serialized.
pub(crate) fn encode_reply<T>(operation: &'static str, body: &T) -> Result<Bytes, ProtocolError>
where
    T: Serialize,
{
    encode_body(operation, body)
}
