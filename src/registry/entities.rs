use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::SimulatorAddress;
use crate::phases::{TestDefinition, TestPhase};

/// Which workers a test runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    All,
    Member,
    Client,
}

impl TargetType {
    #[must_use]
    pub const fn matches(self, is_member: bool) -> bool {
        match self {
            TargetType::All => true,
            TargetType::Member => is_member,
            TargetType::Client => !is_member,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentData {
    pub address: SimulatorAddress,
    /// Endpoint the coordinator dials.
    pub public_endpoint: String,
    /// Endpoint used inside the fleet; equals the public one when unset.
    pub private_endpoint: String,
    pub tags: BTreeMap<String, String>,
    /// Last worker index handed out; never decremented.
    pub next_worker_index: u32,
}

impl AgentData {
    #[must_use]
    pub fn has_distinct_private_endpoint(&self) -> bool {
        self.public_endpoint != self.private_endpoint
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerData {
    pub address: SimulatorAddress,
    pub is_member: bool,
    pub pid: Option<u32>,
    pub last_seen_ms: u64,
    pub ignore_failures: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    InProgress,
    Failed,
    Success,
}

impl CompletionStatus {
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, CompletionStatus::Failed | CompletionStatus::Success)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CompletionStatus::InProgress => "IN_PROGRESS",
            CompletionStatus::Failed => "FAILED",
            CompletionStatus::Success => "SUCCESS",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestData {
    pub test_index: u32,
    pub definition: TestDefinition,
    pub phase: Option<TestPhase>,
    pub started_at_ms: Option<u64>,
    pub status: CompletionStatus,
    pub stop_requested: bool,
    /// First failure detail; later failures are counted, not stored.
    pub failure: Option<String>,
    pub failure_count: u32,
    pub workers: Vec<SimulatorAddress>,
}

impl TestData {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}
