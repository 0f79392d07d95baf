use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::address::{AddressLevel, SimulatorAddress};
use crate::failure::{Failure, FailureCollector, FailureDisposition, FailureType};
use crate::performance::PerformanceAggregator;
use crate::protocol::Operation;
use crate::router::{OperationHandler, Reply, Request, Router};

/// Root-level handler: everything that reaches the coordinator is a report
/// from below.
pub struct CoordinatorHandler {
    collector: Arc<FailureCollector>,
    aggregator: Arc<PerformanceAggregator>,
    closing: AtomicBool,
}

impl CoordinatorHandler {
    #[must_use]
    pub const fn new(collector: Arc<FailureCollector>, aggregator: Arc<PerformanceAggregator>) -> Self {
        Self {
            collector,
            aggregator,
            closing: AtomicBool::new(false),
        }
    }

    /// Agent links closing after this point are part of the shutdown.
    pub fn begin_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    fn record(&self, failure: Failure) {
        match self.collector.record(failure) {
            Ok(FailureDisposition::Recorded {
                failed_tests,
                worker_removed,
            }) => {
                if !failed_tests.is_empty() {
                    info!("Tests marked FAILED: {:?}", failed_tests);
                }
                if worker_removed {
                    debug!("Failed member removed from the registry");
                }
            }
            Ok(FailureDisposition::Ignored) => {}
            Err(err) => warn!("Failed to record failure: {}", err),
        }
    }
}

#[async_trait]
impl OperationHandler for CoordinatorHandler {
    async fn handle(&self, router: &Arc<Router>, request: Request) -> Reply {
        match request.operation {
            Operation::Failure(failure) => {
                self.record(*failure);
                Reply::success()
            }
            Operation::PerformanceState(state) => {
                self.aggregator.update(request.source, &state.stats);
                Reply::success()
            }
            other @ (Operation::Identify
            | Operation::Ping
            | Operation::CreateWorker(_)
            | Operation::TerminateWorker(_)
            | Operation::StartTimeoutDetection
            | Operation::StopTimeoutDetection
            | Operation::IgnoreWorkerFailure(_)
            | Operation::CreateTest(_)
            | Operation::StartTestPhase(_)
            | Operation::IsPhaseCompleted(_)
            | Operation::StopTest) => Reply::unsupported(&other, router.local()),
        }
    }

    async fn link_closed(&self, _router: &Arc<Router>, peer: SimulatorAddress, reason: &str) {
        if peer.level() != AddressLevel::Agent {
            return;
        }
        self.aggregator.remove_source(&peer);
        if self.closing.load(Ordering::Acquire) {
            debug!("Agent {} disconnected: {}", peer, reason);
            return;
        }
        self.record(Failure::new(
            FailureType::AgentUnreachable,
            peer,
            format!("Agent connection lost: {}", reason),
        ));
    }
}
