//! Tests that ship with the binary so a fleet can run without external
//! workloads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TestFailure;
use crate::phases::{FactoryTable, StepOutcome, TestCase, TestContext, TestDefinition, TestPhase};

pub const NOOP_TEST: &str = "noop";
pub const FAIL_TEST: &str = "fail";

#[must_use]
pub fn builtin_factory() -> FactoryTable {
    FactoryTable::new()
        .with(NOOP_TEST, NoopTest::create)
        .with(FAIL_TEST, FailTest::create)
}

/// Counts iterations. `max_iterations` ends each run thread early.
#[derive(Debug, Default)]
pub struct NoopTest {
    iterations: AtomicU64,
    max_iterations: Option<u64>,
}

impl NoopTest {
    /// # Errors
    ///
    /// Returns an error when `max_iterations` is not a number.
    pub fn create(definition: &TestDefinition) -> Result<Arc<dyn TestCase>, TestFailure> {
        let max_iterations = definition
            .property("max_iterations")
            .map(|value| {
                value.parse::<u64>().map_err(|err| {
                    TestFailure::new(format!("Invalid max_iterations '{}': {}", value, err))
                })
            })
            .transpose()?;
        Ok(Arc::new(Self {
            iterations: AtomicU64::new(0),
            max_iterations,
        }))
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }
}

impl TestCase for NoopTest {
    fn time_step(&self, _ctx: &TestContext, _thread: usize) -> Result<StepOutcome, TestFailure> {
        let done = self.iterations.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if self.max_iterations.is_some_and(|max| done >= max) {
            Ok(StepOutcome::StopRequested)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    fn local_verify(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        if self.iterations() == 0 {
            return Err(TestFailure::new("noop test never ran"));
        }
        Ok(())
    }
}

/// Fails in the phase named by the `phase` property (`run` by default).
#[derive(Debug)]
pub struct FailTest {
    phase: TestPhase,
    message: String,
}

impl FailTest {
    /// # Errors
    ///
    /// Returns an error when `phase` does not name a lifecycle phase.
    pub fn create(definition: &TestDefinition) -> Result<Arc<dyn TestCase>, TestFailure> {
        let name = definition.property("phase").unwrap_or("run");
        let phase = TestPhase::DRIVEN
            .into_iter()
            .find(|phase| phase.name() == name)
            .ok_or_else(|| TestFailure::new(format!("Unknown phase '{}'", name)))?;
        let message = definition
            .property("message")
            .map_or_else(|| format!("{} failed in {}", definition.id, phase), str::to_owned);
        Ok(Arc::new(Self { phase, message }))
    }

    fn fail_in(&self, phase: TestPhase) -> Result<(), TestFailure> {
        if phase == self.phase {
            return Err(TestFailure::new(self.message.clone()));
        }
        Ok(())
    }
}

impl TestCase for FailTest {
    fn setup_local(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::SetupLocal)
    }

    fn setup_global(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::SetupGlobal)
    }

    fn start(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::Start)
    }

    fn time_step(&self, _ctx: &TestContext, _thread: usize) -> Result<StepOutcome, TestFailure> {
        self.fail_in(TestPhase::Run)?;
        Ok(StepOutcome::Continue)
    }

    fn stop(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::Stop)
    }

    fn local_verify(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::LocalVerify)
    }

    fn global_verify(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::GlobalVerify)
    }

    fn global_teardown(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::GlobalTeardown)
    }

    fn local_teardown(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        self.fail_in(TestPhase::LocalTeardown)
    }
}
