use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{RunSummary, TestOutcome, run_coordinator};
use crate::agent::Agent;
use crate::config::{AgentEndpoint, AgentSettings, ConnectionSettings, CoordinatorSettings, WorkerSettings};
use crate::error::{AppError, AppResult};
use crate::failure::FailureType;
use crate::performance::PerformanceStats;
use crate::phases::{PhaseSettings, TestDefinition};
use crate::registry::CompletionStatus;
use crate::system::shutdown::shutdown_channel;
use crate::worker::{FAIL_TEST, NOOP_TEST, builtin_factory};

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

fn connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_attempts: 2,
        connect_retry_delay: Duration::from_millis(20),
        handshake_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
        ..ConnectionSettings::default()
    }
}

fn suite_settings(endpoint: String, tests: Vec<TestDefinition>, run_duration: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        agents: vec![AgentEndpoint {
            public: endpoint,
            private: None,
            tags: BTreeMap::new(),
        }],
        workers_per_agent: 2,
        members_per_agent: 1,
        phases: PhaseSettings {
            poll_interval: Duration::from_millis(20),
            phase_timeout: Duration::from_secs(10),
            run_duration,
        },
        performance_interval: Duration::from_millis(50),
        parallel: false,
        tests,
        connection: connection_settings(),
        worker: WorkerSettings {
            performance_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
        },
    }
}

async fn start_agent(home: &Path) -> AppResult<Agent> {
    let (agent_tx, _) = shutdown_channel();
    let mut settings = AgentSettings::with_defaults(1, home.to_path_buf());
    settings.listen = "127.0.0.1:0".to_owned();
    settings.in_process_workers = true;
    settings.failure_check_interval = Duration::from_millis(20);
    settings.performance_interval = Duration::from_millis(50);
    settings.connection = connection_settings();
    Agent::start(settings, Arc::new(builtin_factory()), agent_tx).await
}

fn outcome<'summary>(summary: &'summary RunSummary, id: &str) -> AppResult<&'summary TestOutcome> {
    summary
        .tests
        .iter()
        .find(|test| test.id == id)
        .ok_or_else(|| AppError::from(format!("test {} missing from summary", id)))
}

#[test]
fn suite_reports_success_and_failure() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let agent = start_agent(home.path()).await?;
        let mut noop = TestDefinition::new("counting", NOOP_TEST);
        noop.threads = 2;
        let mut failing = TestDefinition::new("failing", FAIL_TEST);
        failing.properties.insert("phase".to_owned(), "run".to_owned());
        let settings = suite_settings(
            agent.local_addr().to_string(),
            vec![noop, failing],
            Duration::from_millis(150),
        );

        let (shutdown_tx, _) = shutdown_channel();
        let summary = run_coordinator(settings, &shutdown_tx).await?;
        agent.stop().await;

        let counting = outcome(&summary, "counting")?;
        if counting.status != CompletionStatus::Success || counting.failure.is_some() {
            return Err(AppError::from(format!(
                "noop test should succeed: {:?}",
                counting.failure
            )));
        }
        let failing = outcome(&summary, "failing")?;
        if failing.status != CompletionStatus::Failed {
            return Err(AppError::from("fail test should end FAILED"));
        }
        let detail = failing.failure.clone().unwrap_or_default();
        if !detail.contains("failing failed in run") {
            return Err(AppError::from(format!("unexpected failure detail: {}", detail)));
        }
        if summary.failed_tests() != 1 || summary.is_success() {
            return Err(AppError::from("exactly one test should count as failed"));
        }
        Ok(())
    })
}

#[test]
fn unreachable_agent_aborts_the_run() -> AppResult<()> {
    run_async_test(async {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let endpoint = listener.local_addr()?.to_string();
        drop(listener);

        let settings = suite_settings(
            endpoint.clone(),
            vec![TestDefinition::new("never", NOOP_TEST)],
            Duration::from_millis(50),
        );
        let (shutdown_tx, _) = shutdown_channel();
        match run_coordinator(settings, &shutdown_tx).await {
            Err(AppError::AgentsUnreachable { agents }) => {
                if !agents.contains("A1") || !agents.contains(&endpoint) {
                    return Err(AppError::from(format!("agent not named: {}", agents)));
                }
                Ok(())
            }
            Err(err) => Err(AppError::from(format!("unexpected error: {}", err))),
            Ok(_) => Err(AppError::from("run against a dead agent succeeded")),
        }
    })
}

#[test]
fn shutdown_stops_the_running_test_and_skips_the_rest() -> AppResult<()> {
    run_async_test(async {
        let home = tempfile::tempdir()?;
        let agent = start_agent(home.path()).await?;
        let settings = suite_settings(
            agent.local_addr().to_string(),
            vec![
                TestDefinition::new("first", NOOP_TEST),
                TestDefinition::new("second", NOOP_TEST),
            ],
            Duration::from_secs(60),
        );

        let (shutdown_tx, _) = shutdown_channel();
        let trigger = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if trigger.send(()).is_err() {
                // The run already ended.
            }
        });
        let summary = tokio::time::timeout(
            Duration::from_secs(20),
            run_coordinator(settings, &shutdown_tx),
        )
        .await
        .map_err(|_err| AppError::from("shutdown did not end the run"))??;
        agent.stop().await;

        if outcome(&summary, "first")?.status != CompletionStatus::Success {
            return Err(AppError::from("stopped test should still complete"));
        }
        if outcome(&summary, "second")?.status != CompletionStatus::InProgress {
            return Err(AppError::from("second test should never start"));
        }
        Ok(())
    })
}

#[test]
fn summary_lines_list_failures() -> AppResult<()> {
    let summary = RunSummary {
        started_at_ms: 0,
        finished_at_ms: 1_000,
        tests: vec![TestOutcome {
            test_index: 1,
            id: "failing".to_owned(),
            status: CompletionStatus::Failed,
            failure: Some("boom".to_owned()),
            failure_count: 3,
            performance: PerformanceStats {
                operation_count: 10,
                ..PerformanceStats::default()
            },
        }],
        failures_by_type: BTreeMap::from([(FailureType::WorkerException, 3)]),
        ignored_failures: 1,
    };
    let lines = summary.lines();
    let expected = [
        "  test 1 'failing': FAILED",
        "    failure: boom (+2 more)",
        "  failures: WORKER_EXCEPTION=3",
        "  ignored failures: 1",
        "  fleet: ops=10",
    ];
    for prefix in expected {
        if !lines.iter().any(|line| line.starts_with(prefix)) {
            return Err(AppError::from(format!("missing line starting with {:?}", prefix)));
        }
    }
    if summary.total_performance().operation_count != 10 {
        return Err(AppError::from("fleet total should sum the tests"));
    }
    Ok(())
}
