use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::phases::{PhaseSettings, TestDefinition};
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

use super::types::{
    AgentEndpointConfig, ConfigFile, ConnectionConfig, CoordinatorConfig,
    DurationValue, WorkerConfig,
};

const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_AGENT_LISTEN: &str = "127.0.0.1:9000";
const DEFAULT_WORKERS_HOME: &str = "workers";
const DEFAULT_FAILURE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_WORKER_LAST_SEEN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WORKER_START_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PERFORMANCE_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_WORKER_PERFORMANCE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

fn duration_or(
    field: &'static str,
    value: Option<&DurationValue>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), |value| {
        value
            .to_duration()
            .map_err(|err| ConfigError::InvalidDuration {
                field,
                message: err.to_string(),
            })
    })
}

fn positive_u32(field: &'static str, value: Option<u32>, default: u32) -> Result<u32, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::FieldMustBePositive { field }),
        value => Ok(value),
    }
}

fn positive_usize(
    field: &'static str,
    value: Option<usize>,
    default: usize,
) -> Result<usize, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::FieldMustBePositive { field }),
        value => Ok(value),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub handshake_timeout: Duration,
    pub response_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ConnectionSettings {
    /// # Errors
    ///
    /// Returns an error for zero counts or invalid durations.
    pub fn from_config(config: Option<&ConnectionConfig>) -> Result<Self, ConfigError> {
        let Some(config) = config else {
            return Ok(Self::default());
        };
        Ok(Self {
            connect_attempts: positive_u32(
                "connection.connect_attempts",
                config.connect_attempts,
                DEFAULT_CONNECT_ATTEMPTS,
            )?,
            connect_retry_delay: duration_or(
                "connection.connect_retry_delay",
                config.connect_retry_delay.as_ref(),
                DEFAULT_CONNECT_RETRY_DELAY,
            )?,
            handshake_timeout: duration_or(
                "connection.handshake_timeout",
                config.handshake_timeout.as_ref(),
                DEFAULT_HANDSHAKE_TIMEOUT,
            )?,
            response_timeout: duration_or(
                "connection.response_timeout",
                config.response_timeout.as_ref(),
                DEFAULT_RESPONSE_TIMEOUT,
            )?,
            outbound_queue_capacity: positive_usize(
                "connection.outbound_queue_capacity",
                config.outbound_queue_capacity,
                DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            )?,
            max_frame_bytes: positive_usize(
                "connection.max_frame_bytes",
                config.max_frame_bytes,
                DEFAULT_MAX_FRAME_BYTES,
            )?,
        })
    }

    #[must_use]
    pub fn to_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_attempts: Some(self.connect_attempts),
            connect_retry_delay: Some(DurationValue::from_duration(self.connect_retry_delay)),
            handshake_timeout: Some(DurationValue::from_duration(self.handshake_timeout)),
            response_timeout: Some(DurationValue::from_duration(self.response_timeout)),
            outbound_queue_capacity: Some(self.outbound_queue_capacity),
            max_frame_bytes: Some(self.max_frame_bytes),
        }
    }
}

/// One fleet node as supplied by provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub public: String,
    pub private: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl From<&AgentEndpointConfig> for AgentEndpoint {
    fn from(config: &AgentEndpointConfig) -> Self {
        Self {
            public: config.public.clone(),
            private: config.private.clone(),
            tags: config.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub performance_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            performance_interval: DEFAULT_WORKER_PERFORMANCE_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl WorkerSettings {
    /// # Errors
    ///
    /// Returns an error for invalid durations.
    pub fn from_config(config: Option<&WorkerConfig>) -> Result<Self, ConfigError> {
        let Some(config) = config else {
            return Ok(Self::default());
        };
        Ok(Self {
            performance_interval: duration_or(
                "worker.performance_interval",
                config.performance_interval.as_ref(),
                DEFAULT_WORKER_PERFORMANCE_INTERVAL,
            )?,
            heartbeat_interval: duration_or(
                "worker.heartbeat_interval",
                config.heartbeat_interval.as_ref(),
                DEFAULT_HEARTBEAT_INTERVAL,
            )?,
        })
    }

    #[must_use]
    pub fn to_config(&self) -> WorkerConfig {
        WorkerConfig {
            performance_interval: Some(DurationValue::from_duration(self.performance_interval)),
            heartbeat_interval: Some(DurationValue::from_duration(self.heartbeat_interval)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub agents: Vec<AgentEndpoint>,
    pub workers_per_agent: u32,
    pub members_per_agent: u32,
    pub phases: PhaseSettings,
    pub performance_interval: Duration,
    pub parallel: bool,
    pub tests: Vec<TestDefinition>,
    pub connection: ConnectionSettings,
    pub worker: WorkerSettings,
}

impl CoordinatorSettings {
    /// # Errors
    ///
    /// Returns an error when the agent list or suite is empty, a test id
    /// repeats, or any value is out of range.
    pub fn from_config(file: &ConfigFile) -> Result<Self, ConfigError> {
        let config = file.coordinator.clone().unwrap_or_default();
        let agents: Vec<AgentEndpoint> = config
            .agents
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(AgentEndpoint::from)
            .collect();
        if agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        let tests = resolve_tests(&config)?;
        let workers_per_agent =
            positive_u32("coordinator.workers_per_agent", config.workers_per_agent, 1)?;
        let members_per_agent = config.members_per_agent.unwrap_or(0);
        if members_per_agent > workers_per_agent {
            return Err(ConfigError::MembersExceedWorkers {
                members: members_per_agent,
                workers: workers_per_agent,
            });
        }
        let defaults = PhaseSettings::default();
        let phases = PhaseSettings {
            poll_interval: duration_or(
                "coordinator.phase_poll_interval",
                config.phase_poll_interval.as_ref(),
                defaults.poll_interval,
            )?,
            phase_timeout: duration_or(
                "coordinator.phase_timeout",
                config.phase_timeout.as_ref(),
                defaults.phase_timeout,
            )?,
            run_duration: duration_or(
                "coordinator.run_duration",
                config.run_duration.as_ref(),
                defaults.run_duration,
            )?,
        };
        Ok(Self {
            agents,
            workers_per_agent,
            members_per_agent,
            phases,
            performance_interval: duration_or(
                "coordinator.performance_interval",
                config.performance_interval.as_ref(),
                DEFAULT_PERFORMANCE_INTERVAL,
            )?,
            parallel: config.parallel.unwrap_or(false),
            tests,
            connection: ConnectionSettings::from_config(file.connection.as_ref())?,
            worker: WorkerSettings::from_config(file.worker.as_ref())?,
        })
    }
}

fn resolve_tests(config: &CoordinatorConfig) -> Result<Vec<TestDefinition>, ConfigError> {
    let tests = config.tests.clone().unwrap_or_default();
    if tests.is_empty() {
        return Err(ConfigError::NoTests);
    }
    let mut seen = BTreeSet::new();
    for test in &tests {
        if !seen.insert(test.id.as_str()) {
            return Err(ConfigError::DuplicateTestId {
                id: test.id.clone(),
            });
        }
        if test.threads == 0 {
            return Err(ConfigError::FieldMustBePositive {
                field: "tests.threads",
            });
        }
    }
    Ok(tests)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub index: u32,
    pub listen: String,
    pub workers_home: PathBuf,
    /// `None` spawns the running executable.
    pub worker_binary: Option<PathBuf>,
    pub in_process_workers: bool,
    pub failure_check_interval: Duration,
    pub worker_last_seen_timeout: Duration,
    pub worker_start_timeout: Duration,
    pub performance_interval: Duration,
    pub connection: ConnectionSettings,
}

impl AgentSettings {
    /// `index_override` comes from the command line and wins over the file.
    ///
    /// # Errors
    ///
    /// Returns an error when no agent index is known or a value is invalid.
    pub fn from_config(file: &ConfigFile, index_override: Option<u32>) -> Result<Self, ConfigError> {
        let config = file.agent.clone().unwrap_or_default();
        let index = match index_override.or(config.index) {
            Some(0) => {
                return Err(ConfigError::FieldMustBePositive {
                    field: "agent.index",
                });
            }
            Some(index) => index,
            None => return Err(ConfigError::MissingAgentIndex),
        };
        Ok(Self {
            index,
            listen: config
                .listen
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT_LISTEN.to_owned()),
            workers_home: PathBuf::from(
                config
                    .workers_home
                    .as_deref()
                    .unwrap_or(DEFAULT_WORKERS_HOME),
            ),
            worker_binary: config.worker_binary.as_deref().map(PathBuf::from),
            in_process_workers: config.in_process_workers.unwrap_or(false),
            failure_check_interval: duration_or(
                "agent.failure_check_interval",
                config.failure_check_interval.as_ref(),
                DEFAULT_FAILURE_CHECK_INTERVAL,
            )?,
            worker_last_seen_timeout: duration_or(
                "agent.worker_last_seen_timeout",
                config.worker_last_seen_timeout.as_ref(),
                DEFAULT_WORKER_LAST_SEEN_TIMEOUT,
            )?,
            worker_start_timeout: duration_or(
                "agent.worker_start_timeout",
                config.worker_start_timeout.as_ref(),
                DEFAULT_WORKER_START_TIMEOUT,
            )?,
            performance_interval: duration_or(
                "agent.performance_interval",
                config.performance_interval.as_ref(),
                DEFAULT_WORKER_PERFORMANCE_INTERVAL,
            )?,
            connection: ConnectionSettings::from_config(file.connection.as_ref())?,
        })
    }

    #[must_use]
    pub fn with_defaults(index: u32, workers_home: PathBuf) -> Self {
        Self {
            index,
            listen: DEFAULT_AGENT_LISTEN.to_owned(),
            workers_home,
            worker_binary: None,
            in_process_workers: false,
            failure_check_interval: DEFAULT_FAILURE_CHECK_INTERVAL,
            worker_last_seen_timeout: DEFAULT_WORKER_LAST_SEEN_TIMEOUT,
            worker_start_timeout: DEFAULT_WORKER_START_TIMEOUT,
            performance_interval: DEFAULT_WORKER_PERFORMANCE_INTERVAL,
            connection: ConnectionSettings::default(),
        }
    }
}
