//! Structured fault reports and the two places they are produced and
//! consumed: the agent-side [`FailureMonitor`] and the coordinator-side
//! [`FailureCollector`].
mod collector;
mod markers;
mod monitor;


use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::SimulatorAddress;
use crate::system::clock::current_time_ms;

pub use collector::{FailureCollector, FailureDisposition};
pub use markers::{
    EXCEPTION_MARKER_SUFFIX, ExceptionMarker, Marker, MarkerKind, MarkerWriter, OOME_MARKER,
    remove_marker, scan_markers,
};
pub use monitor::{ExitOutcome, FailureMonitor, FailureSink, ProcessHandle, SupervisedWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    WorkerException,
    WorkerOom,
    WorkerTimeout,
    WorkerAbnormalExit,
    WorkerNormalExit,
    WorkerCreateError,
    AgentUnreachable,
}

impl FailureType {
    /// Process failures end the worker's participation in every test.
    #[must_use]
    pub const fn is_process_failure(self) -> bool {
        !matches!(self, FailureType::WorkerException)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FailureType::WorkerException => "WORKER_EXCEPTION",
            FailureType::WorkerOom => "WORKER_OOM",
            FailureType::WorkerTimeout => "WORKER_TIMEOUT",
            FailureType::WorkerAbnormalExit => "WORKER_ABNORMAL_EXIT",
            FailureType::WorkerNormalExit => "WORKER_NORMAL_EXIT",
            FailureType::WorkerCreateError => "WORKER_CREATE_ERROR",
            FailureType::AgentUnreachable => "AGENT_UNREACHABLE",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One detected fault. `member` is the worker (or agent, for
/// `AgentUnreachable`) the fault belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub failure_type: FailureType,
    pub member: SimulatorAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_index: Option<u32>,
    pub message: String,
    pub timestamp_ms: u64,
}

impl Failure {
    #[must_use]
    pub fn new(failure_type: FailureType, member: SimulatorAddress, message: impl Into<String>) -> Self {
        Self {
            failure_type,
            member,
            test_index: None,
            message: message.into(),
            timestamp_ms: current_time_ms(),
        }
    }

    #[must_use]
    pub const fn with_test(mut self, test_index: u32) -> Self {
        self.test_index = Some(test_index);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.test_index {
            Some(test_index) => write!(
                f,
                "{} on {} (test {}): {}",
                self.failure_type, self.member, test_index, self.message
            ),
            None => write!(f, "{} on {}: {}", self.failure_type, self.member, self.message),
        }
    }
}
