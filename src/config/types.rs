use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::phases::TestDefinition;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub connection: Option<ConnectionConfig>,
    pub coordinator: Option<CoordinatorConfig>,
    pub agent: Option<AgentConfig>,
    pub worker: Option<WorkerConfig>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub connect_attempts: Option<u32>,
    pub connect_retry_delay: Option<DurationValue>,
    pub handshake_timeout: Option<DurationValue>,
    pub response_timeout: Option<DurationValue>,
    pub outbound_queue_capacity: Option<usize>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub agents: Option<Vec<AgentEndpointConfig>>,
    pub workers_per_agent: Option<u32>,
    /// Leading workers on each agent that are member-type.
    pub members_per_agent: Option<u32>,
    pub phase_poll_interval: Option<DurationValue>,
    pub phase_timeout: Option<DurationValue>,
    pub run_duration: Option<DurationValue>,
    pub performance_interval: Option<DurationValue>,
    /// Run the suite's tests concurrently instead of one after another.
    pub parallel: Option<bool>,
    pub tests: Option<Vec<TestDefinition>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    pub public: String,
    pub private: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub index: Option<u32>,
    pub listen: Option<String>,
    pub workers_home: Option<String>,
    pub worker_binary: Option<String>,
    /// Host workers as tasks of the agent process instead of child processes.
    pub in_process_workers: Option<bool>,
    pub failure_check_interval: Option<DurationValue>,
    pub worker_last_seen_timeout: Option<DurationValue>,
    pub worker_start_timeout: Option<DurationValue>,
    pub performance_interval: Option<DurationValue>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub performance_interval: Option<DurationValue>,
    pub heartbeat_interval: Option<DurationValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            DurationValue::Seconds(secs) => {
                if *secs == 0 {
                    Err(ConfigError::DurationZero)
                } else {
                    Ok(Duration::from_secs(*secs))
                }
            }
            DurationValue::Text(text) => super::parse_duration_value(text),
        }
    }

    /// Millisecond text form, used when writing a config back out.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        DurationValue::Text(format!("{}ms", duration.as_millis()))
    }
}
