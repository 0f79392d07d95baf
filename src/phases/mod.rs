//! Distributed test lifecycle.
//!
//! Every worker assigned to a test walks the same linear phase list. Local
//! phases run on every participant, global phases on exactly one. The
//! coordinator side advances all participants together, one barrier per
//! phase.
mod container;
mod coordinator;
mod definition;
mod test_case;


use serde::{Deserialize, Serialize};

pub use container::{ExceptionReporter, TestContainer, panic_is_contained};
pub use coordinator::{PhaseSettings, PhaseTransport, TestPhaseCoordinator};
pub use definition::TestDefinition;
pub use test_case::{FactoryTable, StepOutcome, TestCase, TestContext, TestFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    SetupLocal,
    SetupGlobal,
    Start,
    Run,
    Stop,
    LocalVerify,
    GlobalVerify,
    GlobalTeardown,
    LocalTeardown,
    Done,
}

impl TestPhase {
    /// Phases the coordinator drives, in order. `Done` is entered implicitly
    /// once local teardown completes.
    pub const DRIVEN: [TestPhase; 9] = [
        TestPhase::SetupLocal,
        TestPhase::SetupGlobal,
        TestPhase::Start,
        TestPhase::Run,
        TestPhase::Stop,
        TestPhase::LocalVerify,
        TestPhase::GlobalVerify,
        TestPhase::GlobalTeardown,
        TestPhase::LocalTeardown,
    ];

    #[must_use]
    pub const fn first() -> Self {
        TestPhase::SetupLocal
    }

    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            TestPhase::SetupLocal => Some(TestPhase::SetupGlobal),
            TestPhase::SetupGlobal => Some(TestPhase::Start),
            TestPhase::Start => Some(TestPhase::Run),
            TestPhase::Run => Some(TestPhase::Stop),
            TestPhase::Stop => Some(TestPhase::LocalVerify),
            TestPhase::LocalVerify => Some(TestPhase::GlobalVerify),
            TestPhase::GlobalVerify => Some(TestPhase::GlobalTeardown),
            TestPhase::GlobalTeardown => Some(TestPhase::LocalTeardown),
            TestPhase::LocalTeardown => Some(TestPhase::Done),
            TestPhase::Done => None,
        }
    }

    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(
            self,
            TestPhase::SetupGlobal | TestPhase::GlobalVerify | TestPhase::GlobalTeardown
        )
    }

    #[must_use]
    pub const fn is_teardown(self) -> bool {
        matches!(self, TestPhase::GlobalTeardown | TestPhase::LocalTeardown)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TestPhase::SetupLocal => "setup_local",
            TestPhase::SetupGlobal => "setup_global",
            TestPhase::Start => "start",
            TestPhase::Run => "run",
            TestPhase::Stop => "stop",
            TestPhase::LocalVerify => "local_verify",
            TestPhase::GlobalVerify => "global_verify",
            TestPhase::GlobalTeardown => "global_teardown",
            TestPhase::LocalTeardown => "local_teardown",
            TestPhase::Done => "done",
        }
    }
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
