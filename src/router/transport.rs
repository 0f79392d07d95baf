use async_trait::async_trait;

use crate::address::SimulatorAddress;
use crate::error::AppResult;
use crate::phases::{PhaseTransport, TestDefinition, TestPhase};
use crate::protocol::{
    CreateTestOperation, Operation, PhaseProgress, PhaseQueryOperation, StartTestPhaseOperation,
    decode_reply,
};

use super::Router;

#[async_trait]
impl PhaseTransport for Router {
    async fn create_test(
        &self,
        worker: SimulatorAddress,
        test_index: u32,
        definition: &TestDefinition,
    ) -> AppResult<()> {
        let operation = Operation::CreateTest(Box::new(CreateTestOperation {
            test_index,
            definition: definition.clone(),
        }));
        self.call(worker, &operation).await?;
        Ok(())
    }

    async fn start_phase(
        &self,
        participant: SimulatorAddress,
        phase: TestPhase,
        skip: bool,
    ) -> AppResult<()> {
        let operation = Operation::StartTestPhase(StartTestPhaseOperation { phase, skip });
        self.call(participant, &operation).await?;
        Ok(())
    }

    async fn query_phase(
        &self,
        participant: SimulatorAddress,
        phase: TestPhase,
    ) -> AppResult<PhaseProgress> {
        let operation = Operation::IsPhaseCompleted(PhaseQueryOperation { phase });
        let payload = self.call(participant, &operation).await?;
        Ok(decode_reply("is_phase_completed", &payload)?)
    }

    async fn stop_test(&self, participant: SimulatorAddress) -> AppResult<()> {
        self.call(participant, &Operation::StopTest).await?;
        Ok(())
    }
}
