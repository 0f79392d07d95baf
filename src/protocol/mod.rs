//! Special-purpose control-plane protocol: forward-moving messages carrying
//! an operation, backward-moving responses carrying a result code, both in
//! a length-prefixed binary frame.
mod codec;
mod operation;
mod types;

#[cfg(test)]
mod tests;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_BYTES, FrameCodec, decode_frame, encode_frame};
pub use operation::{
    CreateTestOperation, CreateWorkerOperation, Operation, PerformanceStateOperation,
    PhaseProgress, PhaseQueryOperation, StartTestPhaseOperation, WorkerCreated,
    WorkerIndexOperation,
};
pub(crate) use operation::{decode_reply, encode_reply};
pub use types::{CorrelationKey, Frame, FrameKind, Message, OperationType, Response, ResultCode};
