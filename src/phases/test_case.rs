use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::address::SimulatorAddress;
use crate::error::TestFailure;

use super::TestDefinition;

/// Result of one run-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// This thread is done; other threads keep running.
    StopRequested,
}

/// Per-test state shared by the hooks and the run threads.
#[derive(Debug)]
pub struct TestContext {
    address: SimulatorAddress,
    definition: TestDefinition,
    stopped: AtomicBool,
}

impl TestContext {
    #[must_use]
    pub const fn new(address: SimulatorAddress, definition: TestDefinition) -> Self {
        Self {
            address,
            definition,
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn address(&self) -> SimulatorAddress {
        self.address
    }

    #[must_use]
    pub const fn definition(&self) -> &TestDefinition {
        &self.definition
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.definition.property(key)
    }

    /// Advisory; run loops check it between iterations.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// User benchmark logic. One hook per phase; all default to no-ops except the
/// run step.
pub trait TestCase: Send + Sync {
    fn setup_local(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    fn setup_global(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    fn start(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    /// One paced operation on run thread `thread`.
    ///
    /// # Errors
    ///
    /// A failure stops every run thread of the test.
    fn time_step(&self, ctx: &TestContext, thread: usize) -> Result<StepOutcome, TestFailure>;

    fn stop(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    fn local_verify(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    fn global_verify(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    fn global_teardown(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }

    fn local_teardown(&self, _ctx: &TestContext) -> Result<(), TestFailure> {
        Ok(())
    }
}

/// Resolves a test implementation by name.
pub trait TestFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error for unknown test types or invalid properties.
    fn create(&self, definition: &TestDefinition) -> Result<Arc<dyn TestCase>, TestFailure>;
}

pub type TestConstructor = fn(&TestDefinition) -> Result<Arc<dyn TestCase>, TestFailure>;

/// Name to constructor table built at registration time.
#[derive(Debug, Default, Clone)]
pub struct FactoryTable {
    constructors: HashMap<String, TestConstructor>,
}

impl FactoryTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, constructor: TestConstructor) -> Self {
        self.register(name, constructor);
        self
    }

    pub fn register(&mut self, name: &str, constructor: TestConstructor) {
        self.constructors.insert(name.to_owned(), constructor);
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl TestFactory for FactoryTable {
    fn create(&self, definition: &TestDefinition) -> Result<Arc<dyn TestCase>, TestFailure> {
        match self.constructors.get(&definition.test_type) {
            Some(constructor) => constructor(definition),
            None => Err(TestFailure::new(format!(
                "Unknown test type '{}'. Known types: {}",
                definition.test_type,
                self.names().join(", ")
            ))),
        }
    }
}
