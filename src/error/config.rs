use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read fleet config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Fleet config {path} is not valid TOML: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Fleet config {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Cannot render worker config: {source}")]
    RenderWorkerConfig {
        #[source]
        source: toml::ser::Error,
    },
    #[error("Fleet config {path} needs a .toml or .json extension.")]
    UnknownFormat { path: PathBuf },
    #[error("{field} must be at least 1.")]
    FieldMustBePositive { field: &'static str },
    #[error("{field}: {message}")]
    InvalidDuration {
        field: &'static str,
        message: String,
    },
    #[error("Coordinator config needs at least one agent endpoint.")]
    NoAgents,
    #[error("Coordinator config needs at least one test.")]
    NoTests,
    #[error("members_per_agent ({members}) exceeds workers_per_agent ({workers}).")]
    MembersExceedWorkers { members: u32, workers: u32 },
    #[error("Agent index is missing; set agent.index or pass --index.")]
    MissingAgentIndex,
    #[error("Duplicate test id '{id}'.")]
    DuplicateTestId { id: String },
    #[error("Empty duration.")]
    DurationEmpty,
    #[error("'{value}' is not a duration; use forms like 250ms, 5s, 1m30s.")]
    InvalidDurationFormat { value: String },
    #[error("'{value}' has an unreadable count: {source}")]
    InvalidDurationNumber {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Duration '{value}' is too large.")]
    DurationOverflow { value: String },
    #[error("Unknown duration unit '{unit}'; expected ms, s, m or h.")]
    InvalidDurationUnit { unit: String },
    #[error("Duration must be longer than zero.")]
    DurationZero,
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
