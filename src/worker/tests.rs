use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{FailTest, MarkerReporter, NoopTest, WorkerHandler, builtin_factory};
use crate::address::SimulatorAddress;
use crate::error::{AppError, AppResult};
use crate::failure::{MarkerKind, MarkerWriter, scan_markers};
use crate::phases::{StepOutcome, TestContext, TestDefinition, TestPhase};
use crate::protocol::{
    CreateTestOperation, Operation, PhaseProgress, PhaseQueryOperation, ResultCode,
    StartTestPhaseOperation, decode_reply,
};
use crate::router::{OperationHandler, Router};
use crate::system::clock::deadline_after;
use crate::system::shutdown::shutdown_channel;

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

struct LocalWorker {
    router: Arc<Router>,
    handler: Arc<WorkerHandler>,
    home: tempfile::TempDir,
}

fn local_worker() -> AppResult<LocalWorker> {
    let home = tempfile::tempdir()?;
    let (shutdown_tx, _) = shutdown_channel();
    let address = SimulatorAddress::worker(1, 1)?;
    let handler = Arc::new(WorkerHandler::new(
        address,
        Arc::new(builtin_factory()),
        Arc::new(MarkerReporter::new(Arc::new(MarkerWriter::new(home.path())))),
        shutdown_tx,
    ));
    let router = Router::new(address, handler.clone(), Duration::from_secs(2));
    Ok(LocalWorker {
        router,
        handler,
        home,
    })
}

fn create(test_index: u32, definition: TestDefinition) -> Operation {
    Operation::CreateTest(Box::new(CreateTestOperation {
        test_index,
        definition,
    }))
}

async fn drive_phase(
    router: &Router,
    test: SimulatorAddress,
    phase: TestPhase,
) -> AppResult<PhaseProgress> {
    router
        .call(
            test,
            &Operation::StartTestPhase(StartTestPhaseOperation { phase, skip: false }),
        )
        .await?;
    if phase == TestPhase::Run {
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.call(test, &Operation::StopTest).await?;
    }
    let deadline = deadline_after(Duration::from_secs(5));
    loop {
        let payload = router
            .call(test, &Operation::IsPhaseCompleted(PhaseQueryOperation { phase }))
            .await?;
        let progress: PhaseProgress = decode_reply("is_phase_completed", &payload)?;
        if progress.completed {
            return Ok(progress);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::from(format!("{} never completed", phase)));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test]
fn noop_test_walks_every_phase() -> AppResult<()> {
    run_async_test(async {
        let worker = local_worker()?;
        let test = SimulatorAddress::test(1, 1, 1)?;
        worker
            .router
            .call(
                SimulatorAddress::worker(1, 1)?,
                &create(1, TestDefinition::new("noop-1", "noop")),
            )
            .await?;
        if worker.handler.test_count() != 1 {
            return Err(AppError::from("container registered"));
        }
        for phase in TestPhase::DRIVEN {
            let progress = drive_phase(&worker.router, test, phase).await?;
            if let Some(failure) = progress.failure {
                return Err(AppError::from(format!("{} failed: {}", phase, failure)));
            }
            if phase == TestPhase::Run && worker.handler.snapshots().get(&1).is_none() {
                return Err(AppError::from("run produces a performance snapshot"));
            }
        }
        if worker.handler.test_count() != 0 {
            return Err(AppError::from("finished container is released"));
        }
        Ok(())
    })
}

#[test]
fn hook_failure_leaves_marker() -> AppResult<()> {
    run_async_test(async {
        let worker = local_worker()?;
        let mut definition = TestDefinition::new("fails", "fail");
        definition
            .properties
            .insert("phase".to_owned(), "setup_local".to_owned());
        worker
            .router
            .call(SimulatorAddress::worker(1, 1)?, &create(3, definition))
            .await?;
        let progress =
            drive_phase(&worker.router, SimulatorAddress::test(1, 1, 3)?, TestPhase::SetupLocal)
                .await?;
        if progress.failure.as_deref() != Some("fails failed in setup_local") {
            return Err(AppError::from(format!(
                "Unexpected failure: {:?}",
                progress.failure
            )));
        }
        let markers = scan_markers(worker.home.path())?;
        let [marker] = markers.as_slice() else {
            return Err(AppError::from(format!(
                "Expected one marker, found {}",
                markers.len()
            )));
        };
        let expected = matches!(
            &marker.kind,
            MarkerKind::Exception(exception)
                if exception.test_index == Some(3)
                    && exception.phase.as_deref() == Some("setup_local")
        );
        if !expected {
            return Err(AppError::from(format!("Unexpected marker: {:?}", marker.kind)));
        }
        Ok(())
    })
}

#[test]
fn unknown_and_duplicate_tests_are_rejected() -> AppResult<()> {
    run_async_test(async {
        let worker = local_worker()?;
        let missing = worker
            .router
            .request(
                SimulatorAddress::test(1, 1, 9)?,
                &Operation::IsPhaseCompleted(PhaseQueryOperation {
                    phase: TestPhase::SetupLocal,
                }),
            )
            .await?;
        if missing.result_code != ResultCode::FailureTestNotFound {
            return Err(AppError::from(format!(
                "Unexpected code: {:?}",
                missing.result_code
            )));
        }

        let worker_address = SimulatorAddress::worker(1, 1)?;
        worker
            .router
            .call(worker_address, &create(1, TestDefinition::new("a", "noop")))
            .await?;
        let duplicate = worker
            .router
            .request(worker_address, &create(1, TestDefinition::new("a", "noop")))
            .await?;
        if duplicate.result_code != ResultCode::ExceptionDuringOperationExecution {
            return Err(AppError::from("duplicate test index accepted"));
        }

        let unknown_type = worker
            .router
            .request(worker_address, &create(2, TestDefinition::new("b", "map-put")))
            .await?;
        if unknown_type.result_code != ResultCode::ExceptionDuringOperationExecution
            || !unknown_type.payload_text().contains("map-put")
        {
            return Err(AppError::from(format!(
                "Unexpected reply: {}",
                unknown_type.payload_text()
            )));
        }

        let out_of_order = worker
            .router
            .request(
                SimulatorAddress::test(1, 1, 1)?,
                &Operation::StartTestPhase(StartTestPhaseOperation {
                    phase: TestPhase::Run,
                    skip: false,
                }),
            )
            .await?;
        if out_of_order.result_code != ResultCode::ExceptionDuringOperationExecution {
            return Err(AppError::from("phases must not be skipped"));
        }
        Ok(())
    })
}

#[test]
fn losing_the_agent_shuts_the_worker_down() -> AppResult<()> {
    run_async_test(async {
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let address = SimulatorAddress::worker(2, 1)?;
        let handler = Arc::new(WorkerHandler::new(
            address,
            Arc::new(builtin_factory()),
            Arc::new(MarkerReporter::new(Arc::new(MarkerWriter::new(tempfile::tempdir()?.path())))),
            shutdown_tx,
        ));
        let router = Router::new(address, handler.clone(), Duration::from_secs(1));

        handler
            .link_closed(&router, SimulatorAddress::coordinator(), "not ours")
            .await;
        if shutdown_rx.try_recv().is_ok() {
            return Err(AppError::from("only the agent link matters"));
        }
        handler
            .link_closed(&router, SimulatorAddress::agent(2)?, "gone")
            .await;
        if shutdown_rx.try_recv().is_err() {
            return Err(AppError::from("worker keeps running without its agent"));
        }
        Ok(())
    })
}

#[test]
fn builtin_tests_read_their_properties() -> AppResult<()> {
    let mut definition = TestDefinition::new("bounded", "noop");
    definition
        .properties
        .insert("max_iterations".to_owned(), "3".to_owned());
    let noop = NoopTest::create(&definition).map_err(|err| AppError::from(err.message))?;
    let ctx = TestContext::new(SimulatorAddress::test(1, 1, 1)?, definition);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(
            noop.time_step(&ctx, 0)
                .map_err(|err| AppError::from(err.message))?,
        );
    }
    if outcomes.last() != Some(&StepOutcome::StopRequested) {
        return Err(AppError::from("noop stops after max_iterations"));
    }

    let mut bad = TestDefinition::new("bad", "noop");
    bad.properties
        .insert("max_iterations".to_owned(), "many".to_owned());
    if NoopTest::create(&bad).is_ok() {
        return Err(AppError::from("non-numeric max_iterations accepted"));
    }

    let mut unknown_phase = TestDefinition::new("odd", "fail");
    unknown_phase
        .properties
        .insert("phase".to_owned(), "warmup".to_owned());
    if FailTest::create(&unknown_phase).is_ok() {
        return Err(AppError::from("unknown phase accepted"));
    }

    let failing = FailTest::create(&TestDefinition::new("f", "fail"))
        .map_err(|err| AppError::from(err.message))?;
    if failing.time_step(&ctx, 0).is_ok() {
        return Err(AppError::from("fail test fails in run by default"));
    }
    if failing.setup_local(&ctx).is_err() {
        return Err(AppError::from("fail test only fails in its phase"));
    }
    Ok(())
}
