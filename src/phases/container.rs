use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::address::SimulatorAddress;
use crate::error::{PhaseError, TestFailure};
use crate::metronome::{Metronome, build_metronomes};
use crate::performance::{PerformanceStats, PerformanceTracker, SharedProbe};
use crate::protocol::PhaseProgress;

use super::{StepOutcome, TestCase, TestContext, TestDefinition, TestFactory, TestPhase};

thread_local! {
    static CONTAINED: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread runs test code whose panics become test
/// failures. Always false when panics abort.
#[must_use]
pub fn panic_is_contained() -> bool {
    cfg!(panic = "unwind") && CONTAINED.with(Cell::get)
}

fn contain_panics<F>(body: F) -> Result<(), TestFailure>
where
    F: FnOnce() -> Result<(), TestFailure>,
{
    CONTAINED.with(|flag| flag.set(true));
    let outcome = catch_unwind(AssertUnwindSafe(body));
    CONTAINED.with(|flag| flag.set(false));
    outcome.unwrap_or_else(|payload| Err(TestFailure::new(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_owned());
    format!("Panicked: {}", detail)
}

/// Receives hook failures so they reach the failure monitor.
pub trait ExceptionReporter: Send + Sync {
    fn report(&self, test_index: u32, phase: TestPhase, message: &str);
}

#[derive(Debug, Default)]
struct PhaseState {
    completed: Option<TestPhase>,
    running: Option<TestPhase>,
    run_started: bool,
    failures: BTreeMap<TestPhase, String>,
}

/// Worker-side owner of one test instance. Enforces the linear phase order
/// and runs each hook off the I/O threads.
#[derive(Clone)]
pub struct TestContainer {
    test_index: u32,
    context: Arc<TestContext>,
    test: Arc<dyn TestCase>,
    state: Arc<Mutex<PhaseState>>,
    tracker: Arc<Mutex<PerformanceTracker>>,
    reporter: Arc<dyn ExceptionReporter>,
}

impl TestContainer {
    /// # Errors
    ///
    /// Returns an error if the factory cannot build the test.
    pub fn new(
        address: SimulatorAddress,
        definition: TestDefinition,
        factory: &dyn TestFactory,
        reporter: Arc<dyn ExceptionReporter>,
    ) -> Result<Self, PhaseError> {
        let test = factory
            .create(&definition)
            .map_err(|source| PhaseError::CreateTest {
                test_id: definition.id.clone(),
                source,
            })?;
        Ok(Self {
            test_index: address.test_index(),
            context: Arc::new(TestContext::new(address, definition)),
            test,
            state: Arc::new(Mutex::new(PhaseState::default())),
            tracker: Arc::new(Mutex::new(PerformanceTracker::new(Instant::now()))),
            reporter,
        })
    }

    #[must_use]
    pub const fn test_index(&self) -> u32 {
        self.test_index
    }

    #[must_use]
    pub fn context(&self) -> &TestContext {
        &self.context
    }

    /// Starts `phase`. With `skip` the phase is marked complete without
    /// running its hook.
    ///
    /// # Errors
    ///
    /// Returns an error when `phase` is not the successor of the last
    /// completed phase, when a phase is still running, or when the hook
    /// thread cannot be spawned.
    pub fn start_phase(&self, phase: TestPhase, skip: bool) -> Result<(), PhaseError> {
        {
            let mut state = self.lock_state();
            if let Some(running) = state.running {
                return Err(PhaseError::PhaseInProgress {
                    test_index: self.test_index,
                    running,
                });
            }
            let expected = match state.completed {
                None => Some(TestPhase::first()),
                Some(done) => done.next(),
            };
            if expected != Some(phase) || phase == TestPhase::Done {
                return Err(PhaseError::InvalidTransition {
                    test_index: self.test_index,
                    requested: phase,
                    expected,
                });
            }
            state.running = Some(phase);
        }

        if skip {
            debug!("Test {} skipping {}", self.test_index, phase);
            self.finish(phase, None);
            return Ok(());
        }
        debug!("Test {} starting {}", self.test_index, phase);
        if phase == TestPhase::Run {
            self.start_run();
            return Ok(());
        }

        let container = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("test-{}-{}", self.test_index, phase))
            .spawn(move || {
                let failure = contain_panics(|| container.run_hook(phase)).err();
                container.finish(phase, failure.map(|failure| failure.message));
            });
        if let Err(source) = spawned {
            self.lock_state().running = None;
            return Err(PhaseError::SpawnThread {
                test_index: self.test_index,
                source,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn progress(&self, phase: TestPhase) -> PhaseProgress {
        let state = self.lock_state();
        PhaseProgress {
            completed: state.running != Some(phase)
                && state.completed.is_some_and(|done| done >= phase),
            failure: state.failures.get(&phase).cloned(),
        }
    }

    #[must_use]
    pub fn last_completed(&self) -> Option<TestPhase> {
        self.lock_state().completed
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.lock_state().completed == Some(TestPhase::Done)
    }

    pub fn request_stop(&self) {
        info!("Stop requested for test {}", self.test_index);
        self.context.request_stop();
    }

    /// Interval snapshot once the run phase has started.
    #[must_use]
    pub fn performance_snapshot(&self, now: Instant) -> Option<PerformanceStats> {
        if !self.lock_state().run_started {
            return None;
        }
        let mut tracker = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Some(tracker.snapshot(now))
    }

    fn run_hook(&self, phase: TestPhase) -> Result<(), TestFailure> {
        let ctx = self.context.as_ref();
        match phase {
            TestPhase::SetupLocal => self.test.setup_local(ctx),
            TestPhase::SetupGlobal => self.test.setup_global(ctx),
            TestPhase::Start => self.test.start(ctx),
            TestPhase::Stop => self.test.stop(ctx),
            TestPhase::LocalVerify => self.test.local_verify(ctx),
            TestPhase::GlobalVerify => self.test.global_verify(ctx),
            TestPhase::GlobalTeardown => self.test.global_teardown(ctx),
            TestPhase::LocalTeardown => self.test.local_teardown(ctx),
            TestPhase::Run | TestPhase::Done => Ok(()),
        }
    }

    fn start_run(&self) {
        let definition = self.context.definition();
        let threads = usize::try_from(definition.threads.max(1)).unwrap_or(1);
        let metronomes = build_metronomes(&definition.metronome, threads);
        {
            let mut tracker = self
                .tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *tracker = PerformanceTracker::new(Instant::now());
        }
        self.lock_state().run_started = true;
        info!(
            "Test {} running '{}' on {} thread(s)",
            self.test_index, definition.id, threads
        );

        let mut handles: Vec<JoinHandle<Option<TestFailure>>> = Vec::with_capacity(threads);
        let mut setup_failure: Option<String> = None;
        for (thread, metronome) in metronomes.into_iter().enumerate() {
            let probe = match self
                .tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add_probe()
            {
                Ok(probe) => probe,
                Err(message) => {
                    setup_failure = Some(message);
                    break;
                }
            };
            let context = self.context.clone();
            let test = self.test.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("test-{}-run-{}", self.test_index, thread))
                .spawn(move || {
                    let outcome = contain_panics(|| {
                        run_loop(&context, test.as_ref(), thread, metronome, &probe)
                    });
                    if outcome.is_err() {
                        context.request_stop();
                    }
                    outcome.err()
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    setup_failure = Some(format!("Failed to spawn run thread {}: {}", thread, err));
                    break;
                }
            }
        }
        if setup_failure.is_some() {
            self.context.request_stop();
        }

        let container = self.clone();
        let supervisor = std::thread::Builder::new()
            .name(format!("test-{}-run", self.test_index))
            .spawn(move || {
                let mut failure = setup_failure;
                for handle in handles {
                    let outcome = match handle.join() {
                        Ok(outcome) => outcome.map(|failure| failure.message),
                        Err(_) => Some("Run thread panicked.".to_owned()),
                    };
                    if failure.is_none() {
                        failure = outcome;
                    }
                }
                container.finish(TestPhase::Run, failure);
            });
        if let Err(err) = supervisor {
            self.context.request_stop();
            self.finish(
                TestPhase::Run,
                Some(format!("Failed to spawn run supervisor: {}", err)),
            );
        }
    }

    fn finish(&self, phase: TestPhase, failure: Option<String>) {
        if let Some(message) = failure.as_deref() {
            warn!("Test {} failed in {}: {}", self.test_index, phase, message);
            self.reporter.report(self.test_index, phase, message);
        }
        let mut state = self.lock_state();
        state.running = None;
        state.completed = Some(if phase == TestPhase::LocalTeardown {
            TestPhase::Done
        } else {
            phase
        });
        if let Some(message) = failure {
            state.failures.insert(phase, message);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_loop(
    context: &TestContext,
    test: &dyn TestCase,
    thread: usize,
    mut metronome: Box<dyn Metronome>,
    probe: &SharedProbe,
) -> Result<(), TestFailure> {
    while !context.is_stopped() {
        let scheduled = metronome.wait_for_next();
        if context.is_stopped() {
            break;
        }
        let outcome = test.time_step(context, thread);
        if let Ok(mut probe) = probe.lock() {
            probe.record(scheduled.elapsed());
        }
        match outcome {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::StopRequested) => break,
            Err(failure) => {
                context.request_stop();
                return Err(failure);
            }
        }
    }
    Ok(())
}
