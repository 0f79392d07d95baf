use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::SimulatorAddress;
use crate::error::{AppError, AppResult, PhaseError};
use crate::protocol::PhaseProgress;
use crate::registry::{CompletionStatus, ComponentRegistry};

use super::{TestDefinition, TestPhase};

/// Operations the phase coordinator sends to test participants. `worker` is
/// a worker address; `participant` is the test address on that worker.
#[async_trait]
pub trait PhaseTransport: Send + Sync {
    async fn create_test(
        &self,
        worker: SimulatorAddress,
        test_index: u32,
        definition: &TestDefinition,
    ) -> AppResult<()>;

    async fn start_phase(
        &self,
        participant: SimulatorAddress,
        phase: TestPhase,
        skip: bool,
    ) -> AppResult<()>;

    async fn query_phase(
        &self,
        participant: SimulatorAddress,
        phase: TestPhase,
    ) -> AppResult<PhaseProgress>;

    async fn stop_test(&self, participant: SimulatorAddress) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSettings {
    pub poll_interval: Duration,
    /// Upper bound for one phase barrier.
    pub phase_timeout: Duration,
    /// Time between starting `Run` and sending `StopTest`.
    pub run_duration: Duration,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            phase_timeout: Duration::from_secs(300),
            run_duration: Duration::from_secs(30),
        }
    }
}

/// Drives one test through every phase on all of its participants.
pub struct TestPhaseCoordinator<T: PhaseTransport + ?Sized> {
    transport: Arc<T>,
    registry: ComponentRegistry,
    settings: PhaseSettings,
}

impl<T: PhaseTransport + ?Sized> TestPhaseCoordinator<T> {
    #[must_use]
    pub const fn new(transport: Arc<T>, registry: ComponentRegistry, settings: PhaseSettings) -> Self {
        Self {
            transport,
            registry,
            settings,
        }
    }

    /// Runs the test on `workers` and returns its terminal status.
    ///
    /// A participant that fails a phase marks the test `FAILED`; the remaining
    /// non-teardown phases are then advanced with `skip` and both teardown
    /// phases still run. A participant that stops answering is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the test is not registered.
    pub async fn run(
        &mut self,
        test_index: u32,
        workers: &[SimulatorAddress],
    ) -> AppResult<CompletionStatus> {
        let test = self
            .registry
            .test(test_index)
            .ok_or_else(|| AppError::phase(PhaseError::UnknownTest { test_index }))?;
        let definition = test.definition;
        if workers.is_empty() {
            self.fail(
                test_index,
                &PhaseError::NoParticipants {
                    test_id: definition.id.clone(),
                }
                .to_string(),
            )?;
            return Ok(self.registry.complete_test(test_index)?);
        }
        self.registry.set_test_workers(test_index, workers.to_vec())?;
        info!(
            "Test {} '{}' starting on {} worker(s)",
            test_index,
            definition.id,
            workers.len()
        );

        let mut participants = self.create_on_workers(test_index, &definition, workers).await?;

        for phase in TestPhase::DRIVEN {
            // Re-chosen every phase so a dropped owner hands global work on.
            let Some(global) = participants.iter().next().copied() else {
                break;
            };
            self.registry.set_test_phase(test_index, phase)?;
            let skip_all = !phase.is_teardown() && self.registry.is_failed(test_index)?;
            debug!("Test {} entering {} (skip={})", test_index, phase, skip_all);

            let starts = participants.iter().map(|participant| {
                let skip = skip_all || (phase.is_global() && *participant != global);
                let transport = self.transport.clone();
                let participant = *participant;
                async move {
                    (participant, transport.start_phase(participant, phase, skip).await)
                }
            });
            for (participant, result) in join_all(starts).await {
                if let Err(err) = result {
                    self.drop_participant(
                        test_index,
                        &mut participants,
                        participant,
                        &format!("{} failed to start {}: {}", participant, phase, err),
                    )?;
                }
            }

            if phase == TestPhase::Run && !skip_all {
                self.wait_run_duration(test_index).await?;
                let stops = participants.iter().map(|participant| {
                    let transport = self.transport.clone();
                    let participant = *participant;
                    async move { (participant, transport.stop_test(participant).await) }
                });
                for (participant, result) in join_all(stops).await {
                    if let Err(err) = result {
                        warn!("StopTest to {} failed: {}", participant, err);
                    }
                }
            }

            self.await_barrier(test_index, phase, &mut participants).await?;
        }

        let status = self.registry.complete_test(test_index)?;
        info!("Test {} '{}' finished: {}", test_index, definition.id, status);
        Ok(status)
    }

    async fn create_on_workers(
        &mut self,
        test_index: u32,
        definition: &TestDefinition,
        workers: &[SimulatorAddress],
    ) -> AppResult<BTreeSet<SimulatorAddress>> {
        let creates = workers.iter().map(|worker| {
            let transport = self.transport.clone();
            let worker = *worker;
            async move {
                (
                    worker,
                    transport.create_test(worker, test_index, definition).await,
                )
            }
        });
        let mut participants = BTreeSet::new();
        for (worker, result) in join_all(creates).await {
            match result.and_then(|()| worker.child(test_index).map_err(AppError::from)) {
                Ok(participant) => {
                    participants.insert(participant);
                }
                Err(err) => {
                    self.fail(
                        test_index,
                        &format!("Failed to create test on {}: {}", worker, err),
                    )?;
                    self.registry.drop_test_worker(test_index, &worker)?;
                }
            }
        }
        Ok(participants)
    }

    async fn wait_run_duration(&mut self, test_index: u32) -> AppResult<()> {
        let started = Instant::now();
        let deadline = started.checked_add(self.settings.run_duration).unwrap_or(started);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let stop_requested = self
                .registry
                .test(test_index)
                .is_none_or(|test| test.stop_requested);
            if stop_requested || self.registry.is_failed(test_index)? {
                debug!("Test {} run ended early", test_index);
                return Ok(());
            }
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }

    /// Polls every participant until all report `phase` complete or the phase
    /// timeout passes. Never advances on a missing acknowledgement.
    async fn await_barrier(
        &mut self,
        test_index: u32,
        phase: TestPhase,
        participants: &mut BTreeSet<SimulatorAddress>,
    ) -> AppResult<()> {
        let started = Instant::now();
        let deadline = started.checked_add(self.settings.phase_timeout).unwrap_or(started);
        let mut pending: BTreeSet<SimulatorAddress> = participants.clone();
        loop {
            let queries = pending.iter().map(|participant| {
                let transport = self.transport.clone();
                let participant = *participant;
                async move { (participant, transport.query_phase(participant, phase).await) }
            });
            for (participant, result) in join_all(queries).await {
                match result {
                    Ok(progress) => {
                        if let Some(failure) = progress.failure {
                            self.fail(
                                test_index,
                                &format!("{} failed in {}: {}", participant, phase, failure),
                            )?;
                        }
                        if progress.completed {
                            pending.remove(&participant);
                        }
                    }
                    Err(err) => {
                        pending.remove(&participant);
                        self.drop_participant(
                            test_index,
                            participants,
                            participant,
                            &format!("{} lost during {}: {}", participant, phase, err),
                        )?;
                    }
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let stuck: Vec<String> = pending.iter().map(ToString::to_string).collect();
                self.fail(
                    test_index,
                    &format!(
                        "Phase {} timed out after {:?} on {}",
                        phase,
                        self.settings.phase_timeout,
                        stuck.join(", ")
                    ),
                )?;
                for participant in pending {
                    participants.remove(&participant);
                    if let Ok(worker) = participant.parent() {
                        self.registry.drop_test_worker(test_index, &worker)?;
                    }
                }
                return Ok(());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    fn drop_participant(
        &mut self,
        test_index: u32,
        participants: &mut BTreeSet<SimulatorAddress>,
        participant: SimulatorAddress,
        detail: &str,
    ) -> AppResult<()> {
        participants.remove(&participant);
        if let Ok(worker) = participant.parent() {
            self.registry.drop_test_worker(test_index, &worker)?;
        }
        self.fail(test_index, detail)
    }

    fn fail(&mut self, test_index: u32, detail: &str) -> AppResult<()> {
        if self.registry.fail_test(test_index, detail)? {
            warn!("Test {} FAILED: {}", test_index, detail);
        } else {
            debug!("Test {} additional failure: {}", test_index, detail);
        }
        Ok(())
    }
}
