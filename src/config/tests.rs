use std::time::Duration;

use tempfile::tempdir;

use super::types::{ConfigFile, DurationValue};
use super::{
    AgentSettings, ConnectionSettings, CoordinatorSettings, WorkerSettings, load_config_file,
    parse_duration_value, write_config_file,
};
use crate::error::{AppError, AppResult, ConfigError};
use crate::metronome::MetronomeKind;
use crate::registry::TargetType;

const COORDINATOR_TOML: &str = r#"
[connection]
connect_attempts = 3
connect_retry_delay = "250ms"
response_timeout = 30

[coordinator]
workers_per_agent = 2
members_per_agent = 1
phase_poll_interval = "100ms"
run_duration = "2m"

[[coordinator.agents]]
public = "10.0.0.1:9000"
private = "192.168.0.1:9000"
tags = { zone = "a" }

[[coordinator.agents]]
public = "10.0.0.2:9000"

[[coordinator.tests]]
id = "smoke"
test_type = "noop"
threads = 4
target = "client"

[coordinator.tests.metronome]
kind = "sleeping"
interval_us = 1000

[worker]
heartbeat_interval = "2s"
"#;

#[test]
fn coordinator_toml_resolves() -> AppResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fleetsim.toml");
    std::fs::write(&path, COORDINATOR_TOML)?;

    let settings = CoordinatorSettings::from_config(&load_config_file(&path)?)?;
    if settings.agents.len() != 2 || settings.workers_per_agent != 2 {
        return Err(AppError::from(format!("Unexpected fleet {:?}", settings.agents)));
    }
    let first = settings
        .agents
        .first()
        .ok_or_else(|| AppError::from("missing agent"))?;
    if first.private.as_deref() != Some("192.168.0.1:9000")
        || first.tags.get("zone").map(String::as_str) != Some("a")
    {
        return Err(AppError::from(format!("Unexpected endpoint {:?}", first)));
    }
    if settings.phases.poll_interval != Duration::from_millis(100)
        || settings.phases.run_duration != Duration::from_secs(120)
    {
        return Err(AppError::from(format!("Unexpected phases {:?}", settings.phases)));
    }
    if settings.connection.connect_attempts != 3
        || settings.connection.connect_retry_delay != Duration::from_millis(250)
        || settings.connection.response_timeout != Duration::from_secs(30)
    {
        return Err(AppError::from(format!(
            "Unexpected connection {:?}",
            settings.connection
        )));
    }
    let test = settings
        .tests
        .first()
        .ok_or_else(|| AppError::from("missing test"))?;
    if test.threads != 4
        || test.target != TargetType::Client
        || test.metronome.kind != MetronomeKind::Sleeping
        || !test.metronome.account_for_coordinated_omission
    {
        return Err(AppError::from(format!("Unexpected test {:?}", test)));
    }
    if settings.worker.heartbeat_interval != Duration::from_secs(2) {
        return Err(AppError::from("Worker section ignored"));
    }
    Ok(())
}

#[test]
fn coordinator_json_resolves() -> AppResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fleetsim.json");
    let content = r#"{
  "coordinator": {
    "agents": [{ "public": "127.0.0.1:9000" }],
    "tests": [{ "id": "a", "test_type": "noop", "threads": 1 }]
  }
}"#;
    std::fs::write(&path, content)?;
    let settings = CoordinatorSettings::from_config(&load_config_file(&path)?)?;
    if settings.workers_per_agent != 1 || settings.members_per_agent != 0 || settings.parallel {
        return Err(AppError::from("Defaults not applied"));
    }
    Ok(())
}

#[test]
fn coordinator_validation() -> AppResult<()> {
    let cases = [
        ("[coordinator]\n", "agents"),
        (
            "[[coordinator.agents]]\npublic = \"a:1\"\n",
            "tests",
        ),
        (
            "[coordinator]\nworkers_per_agent = 1\nmembers_per_agent = 2\n[[coordinator.agents]]\npublic = \"a:1\"\n[[coordinator.tests]]\nid = \"a\"\ntest_type = \"noop\"\n",
            "members",
        ),
        (
            "[[coordinator.agents]]\npublic = \"a:1\"\n[[coordinator.tests]]\nid = \"a\"\ntest_type = \"noop\"\n[[coordinator.tests]]\nid = \"a\"\ntest_type = \"fail\"\n",
            "duplicate",
        ),
    ];
    for (content, label) in cases {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|err| AppError::from(format!("{}: {}", label, err)))?;
        let result = CoordinatorSettings::from_config(&file);
        let matched = matches!(
            (label, &result),
            ("agents", Err(ConfigError::NoAgents))
                | ("tests", Err(ConfigError::NoTests))
                | ("members", Err(ConfigError::MembersExceedWorkers { .. }))
                | ("duplicate", Err(ConfigError::DuplicateTestId { .. }))
        );
        if !matched {
            return Err(AppError::from(format!("{}: unexpected {:?}", label, result.err())));
        }
    }
    Ok(())
}

#[test]
fn agent_index_comes_from_flag_or_file() -> AppResult<()> {
    let file: ConfigFile = toml::from_str("[agent]\nindex = 2\nworkers_home = \"/tmp/w\"\n")
        .map_err(|err| AppError::from(err.to_string()))?;
    let from_file = AgentSettings::from_config(&file, None)?;
    let from_flag = AgentSettings::from_config(&file, Some(5))?;
    if from_file.index != 2 || from_flag.index != 5 {
        return Err(AppError::from("Agent index precedence is wrong"));
    }
    if from_file.workers_home != std::path::Path::new("/tmp/w") {
        return Err(AppError::from("workers_home ignored"));
    }
    let missing = AgentSettings::from_config(&ConfigFile::default(), None);
    if !matches!(missing, Err(ConfigError::MissingAgentIndex)) {
        return Err(AppError::from(format!("Unexpected {:?}", missing)));
    }
    Ok(())
}

#[test]
fn zero_values_are_rejected() -> AppResult<()> {
    let file: ConfigFile = toml::from_str("[connection]\nconnect_attempts = 0\n")
        .map_err(|err| AppError::from(err.to_string()))?;
    let attempts = ConnectionSettings::from_config(file.connection.as_ref());
    if !matches!(
        attempts,
        Err(ConfigError::FieldMustBePositive {
            field: "connection.connect_attempts",
        })
    ) {
        return Err(AppError::from(format!("Unexpected {:?}", attempts)));
    }
    let worker_file: ConfigFile = toml::from_str("[worker]\nheartbeat_interval = 0\n")
        .map_err(|err| AppError::from(err.to_string()))?;
    let heartbeat = WorkerSettings::from_config(worker_file.worker.as_ref());
    if !matches!(
        heartbeat,
        Err(ConfigError::InvalidDuration {
            field: "worker.heartbeat_interval",
            ..
        })
    ) {
        return Err(AppError::from(format!("Unexpected {:?}", heartbeat)));
    }
    Ok(())
}

#[test]
fn parse_duration_units() -> AppResult<()> {
    let cases = [
        ("250ms", Duration::from_millis(250)),
        ("5", Duration::from_secs(5)),
        ("5s", Duration::from_secs(5)),
        ("2m", Duration::from_secs(120)),
        ("1h", Duration::from_secs(3600)),
        ("1m30s", Duration::from_secs(90)),
        ("2s500ms", Duration::from_millis(2500)),
    ];
    for (text, expected) in cases {
        let parsed = parse_duration_value(text)?;
        if parsed != expected {
            return Err(AppError::from(format!("{} parsed as {:?}", text, parsed)));
        }
    }
    for bad in ["", "ms", "5d", "0s", "1m30", "s5"] {
        if parse_duration_value(bad).is_ok() {
            return Err(AppError::from(format!("'{}' was accepted", bad)));
        }
    }
    Ok(())
}

#[test]
fn written_worker_config_loads_back() -> AppResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("worker.toml");
    let worker = WorkerSettings {
        performance_interval: Duration::from_millis(1500),
        heartbeat_interval: Duration::from_secs(3),
    };
    let connection = ConnectionSettings::default();
    let file = ConfigFile {
        connection: Some(connection.to_config()),
        worker: Some(worker.to_config()),
        ..ConfigFile::default()
    };
    write_config_file(&path, &file)?;
    let loaded = load_config_file(&path)?;
    if WorkerSettings::from_config(loaded.worker.as_ref())? != worker
        || ConnectionSettings::from_config(loaded.connection.as_ref())? != connection
    {
        return Err(AppError::from("Worker config changed on the way through disk"));
    }
    if loaded
        .worker
        .and_then(|worker| worker.performance_interval)
        != Some(DurationValue::Text("1500ms".to_owned()))
    {
        return Err(AppError::from("Durations are not written in ms"));
    }
    Ok(())
}

#[test]
fn unknown_extension_is_rejected_before_reading() -> AppResult<()> {
    let missing = std::path::Path::new("fleet-does-not-exist.yaml");
    let loaded = load_config_file(missing);
    if !matches!(&loaded, Err(AppError::Config(ConfigError::UnknownFormat { path })) if path == missing)
    {
        return Err(AppError::from(format!("Unexpected {:?}", loaded)));
    }
    let dir = tempdir()?;
    let absent = dir.path().join("fleet.toml");
    let unreadable = load_config_file(&absent);
    if !matches!(unreadable, Err(AppError::Config(ConfigError::Read { .. }))) {
        return Err(AppError::from("missing file should report a read error"));
    }
    Ok(())
}
