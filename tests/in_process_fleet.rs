use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleetsim::agent::Agent;
use fleetsim::config::{
    AgentEndpoint, AgentSettings, ConnectionSettings, CoordinatorSettings, WorkerSettings,
};
use fleetsim::coordinator::run_coordinator;
use fleetsim::phases::{PhaseSettings, TestDefinition};
use fleetsim::registry::{CompletionStatus, TargetType};
use fleetsim::system::shutdown::shutdown_channel;
use fleetsim::worker::{FAIL_TEST, NOOP_TEST, builtin_factory};

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| format!("runtime failed: {}", err))
}

#[test]
fn targets_split_members_and_clients_across_two_agents() -> Result<(), String> {
    runtime()?.block_on(async {
        let home = tempfile::tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
        let mut agents = Vec::new();
        let mut endpoints = Vec::new();
        for index in 1..=2 {
            let (agent_tx, _) = shutdown_channel();
            let mut settings = AgentSettings::with_defaults(index, home.path().join(format!("agent{}", index)));
            settings.listen = "127.0.0.1:0".to_owned();
            settings.in_process_workers = true;
            settings.failure_check_interval = Duration::from_millis(25);
            let agent = Agent::start(settings, Arc::new(builtin_factory()), agent_tx)
                .await
                .map_err(|err| format!("agent {} failed to start: {}", index, err))?;
            endpoints.push(AgentEndpoint {
                public: agent.local_addr().to_string(),
                private: None,
                tags: BTreeMap::new(),
            });
            agents.push(agent);
        }

        let mut members = TestDefinition::new("members", NOOP_TEST);
        members.target = TargetType::Member;
        let mut clients = TestDefinition::new("clients", FAIL_TEST);
        clients.target = TargetType::Client;
        clients
            .properties
            .insert("phase".to_owned(), "global_verify".to_owned());

        let settings = CoordinatorSettings {
            agents: endpoints,
            workers_per_agent: 2,
            members_per_agent: 1,
            phases: PhaseSettings {
                poll_interval: Duration::from_millis(20),
                phase_timeout: Duration::from_secs(10),
                run_duration: Duration::from_millis(200),
            },
            performance_interval: Duration::from_millis(100),
            parallel: true,
            tests: vec![members, clients],
            connection: ConnectionSettings::default(),
            worker: WorkerSettings::default(),
        };
        let (shutdown_tx, _) = shutdown_channel();
        let summary = run_coordinator(settings, &shutdown_tx)
            .await
            .map_err(|err| format!("run failed: {}", err))?;
        for agent in agents {
            agent.stop().await;
        }

        let status_of = |id: &str| {
            summary
                .tests
                .iter()
                .find(|test| test.id == id)
                .map(|test| test.status)
        };
        if status_of("members") != Some(CompletionStatus::Success) {
            return Err(format!("members test: {:?}", status_of("members")));
        }
        if status_of("clients") != Some(CompletionStatus::Failed) {
            return Err(format!("clients test: {:?}", status_of("clients")));
        }
        if summary.failed_tests() != 1 {
            return Err(format!("expected one failed test, got {}", summary.failed_tests()));
        }
        Ok(())
    })
}
