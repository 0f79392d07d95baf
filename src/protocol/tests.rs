use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_BYTES, Frame, FrameCodec, Message, Operation,
    OperationType, PhaseQueryOperation, ResultCode, StartTestPhaseOperation, decode_frame,
    encode_frame,
};
use crate::address::SimulatorAddress;
use crate::error::ProtocolError;
use crate::phases::TestPhase;

fn sample_message() -> Result<Message, ProtocolError> {
    let operation = Operation::StartTestPhase(StartTestPhaseOperation {
        phase: TestPhase::Run,
        skip: false,
    });
    let destination = SimulatorAddress::test(2, 3, 1)
        .map_err(|source| ProtocolError::InvalidAddress { field: "test", source })?;
    Ok(Message {
        source: SimulatorAddress::coordinator(),
        destination,
        id: 17,
        operation_type: operation.operation_type(),
        payload: operation.to_payload()?,
    })
}

#[test]
fn message_frame_survives_codec() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let mut buffer = BytesMut::new();
    encode_frame(&Frame::Message(message.clone()), &mut buffer, DEFAULT_MAX_FRAME_BYTES)?;
    let expected_len = 4 + FRAME_HEADER_BYTES + message.payload.len();
    if buffer.len() != expected_len {
        return Err(ProtocolError::from(format!(
            "Encoded {} bytes, expected {}",
            buffer.len(),
            expected_len
        )));
    }
    let decoded = decode_frame(&mut buffer, DEFAULT_MAX_FRAME_BYTES)?;
    let Some(Frame::Message(decoded)) = decoded else {
        return Err(ProtocolError::from("Expected a message frame"));
    };
    if decoded != message {
        return Err(ProtocolError::from(format!("Decoded {:?}", decoded)));
    }
    if !buffer.is_empty() {
        return Err(ProtocolError::from("Decoder left trailing bytes"));
    }
    let operation = Operation::from_payload(decoded.operation_type, &decoded.payload)?;
    if !matches!(&operation, Operation::StartTestPhase(body) if body.phase == TestPhase::Run && !body.skip)
    {
        return Err(ProtocolError::from(format!("Unexpected operation {:?}", operation)));
    }
    Ok(())
}

#[test]
fn partial_frame_waits_for_more_bytes() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let mut full = BytesMut::new();
    encode_frame(&Frame::Message(message), &mut full, DEFAULT_MAX_FRAME_BYTES)?;
    let total = full.len();
    let mut codec = FrameCodec::default();
    let mut partial = BytesMut::new();
    for (offset, byte) in full.iter().enumerate() {
        partial.put_u8(*byte);
        let decoded = codec.decode(&mut partial)?;
        let is_last = offset.saturating_add(1) == total;
        if decoded.is_some() != is_last {
            return Err(ProtocolError::from(format!(
                "Unexpected decode result at byte {}",
                offset
            )));
        }
    }
    Ok(())
}

#[test]
fn two_frames_in_one_buffer_decode_in_order() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let response = message.reply(message.destination, ResultCode::Success, Bytes::new());
    let mut codec = FrameCodec::default();
    let mut buffer = BytesMut::new();
    codec.encode(Frame::Message(message), &mut buffer)?;
    codec.encode(Frame::Response(response.clone()), &mut buffer)?;

    let first = codec.decode(&mut buffer)?;
    if !matches!(first, Some(Frame::Message(_))) {
        return Err(ProtocolError::from("First frame was not the message"));
    }
    let second = codec.decode(&mut buffer)?;
    if !matches!(&second, Some(Frame::Response(decoded)) if *decoded == response) {
        return Err(ProtocolError::from(format!("Unexpected second frame {:?}", second)));
    }
    Ok(())
}

#[test]
fn response_correlates_with_message() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let response = message.reply(
        message.destination,
        ResultCode::FailureTestNotFound,
        Bytes::from_static(b"missing"),
    );
    if response.correlation_key() != message.correlation_key() {
        return Err(ProtocolError::from(format!(
            "Key {} does not match {}",
            response.correlation_key(),
            message.correlation_key()
        )));
    }
    if response.payload_text() != "missing" {
        return Err(ProtocolError::from("Payload text lost"));
    }
    if message.correlation_key().to_string() != "17_C" {
        return Err(ProtocolError::from(message.correlation_key().to_string()));
    }
    Ok(())
}

#[test]
fn short_length_is_rejected() -> Result<(), ProtocolError> {
    let mut buffer = BytesMut::new();
    buffer.put_u32(3);
    buffer.put_slice(&[1, 2, 3]);
    let result = decode_frame(&mut buffer, DEFAULT_MAX_FRAME_BYTES);
    if !matches!(result, Err(ProtocolError::FrameTooShort { length: 3, .. })) {
        return Err(ProtocolError::from(format!("Unexpected result {:?}", result)));
    }
    Ok(())
}

#[test]
fn oversized_frames_are_rejected_both_ways() -> Result<(), ProtocolError> {
    let mut message = sample_message()?;
    message.payload = Bytes::from(vec![0_u8; 128]);
    let mut buffer = BytesMut::new();
    let encoded = encode_frame(&Frame::Message(message), &mut buffer, 64);
    if !matches!(encoded, Err(ProtocolError::FrameTooLarge { max: 64, .. })) {
        return Err(ProtocolError::from(format!("Unexpected encode {:?}", encoded)));
    }

    buffer.clear();
    buffer.put_u32(1_000);
    let result = decode_frame(&mut buffer, 64);
    if !matches!(result, Err(ProtocolError::FrameTooLarge { length: 1_000, .. })) {
        return Err(ProtocolError::from(format!("Unexpected decode {:?}", result)));
    }
    Ok(())
}

#[test]
fn invalid_address_is_rejected() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let mut buffer = BytesMut::new();
    encode_frame(&Frame::Message(message), &mut buffer, DEFAULT_MAX_FRAME_BYTES)?;
    // Source level byte sits after the length prefix and the kind byte.
    if let Some(level) = buffer.get_mut(5) {
        *level = 9;
    }
    let result = decode_frame(&mut buffer, DEFAULT_MAX_FRAME_BYTES);
    if !matches!(result, Err(ProtocolError::InvalidAddress { field: "source", .. })) {
        return Err(ProtocolError::from(format!("Unexpected result {:?}", result)));
    }
    Ok(())
}

#[test]
fn unknown_operation_type_is_rejected() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let mut buffer = BytesMut::new();
    encode_frame(&Frame::Message(message), &mut buffer, DEFAULT_MAX_FRAME_BYTES)?;
    let code_offset: usize = 4 + 1 + 13 + 13 + 8;
    if let Some(slot) = buffer.get_mut(code_offset..code_offset.saturating_add(4)) {
        slot.copy_from_slice(&999_i32.to_be_bytes());
    }
    let result = decode_frame(&mut buffer, DEFAULT_MAX_FRAME_BYTES);
    if !matches!(result, Err(ProtocolError::UnknownOperationType { code: 999 })) {
        return Err(ProtocolError::from(format!("Unexpected result {:?}", result)));
    }
    Ok(())
}

#[test]
fn payload_length_must_match_frame() -> Result<(), ProtocolError> {
    let message = sample_message()?;
    let mut buffer = BytesMut::new();
    encode_frame(&Frame::Message(message), &mut buffer, DEFAULT_MAX_FRAME_BYTES)?;
    let payload_len_offset: usize = 4 + 1 + 13 + 13 + 8 + 4;
    if let Some(slot) = buffer.get_mut(payload_len_offset..payload_len_offset.saturating_add(4)) {
        slot.copy_from_slice(&1_u32.to_be_bytes());
    }
    let result = decode_frame(&mut buffer, DEFAULT_MAX_FRAME_BYTES);
    if !matches!(result, Err(ProtocolError::PayloadLengthMismatch { declared: 1, .. })) {
        return Err(ProtocolError::from(format!("Unexpected result {:?}", result)));
    }
    Ok(())
}

#[test]
fn unit_operations_carry_no_payload() -> Result<(), ProtocolError> {
    for operation in [
        Operation::Identify,
        Operation::Ping,
        Operation::StartTimeoutDetection,
        Operation::StopTimeoutDetection,
        Operation::StopTest,
    ] {
        if !operation.to_payload()?.is_empty() {
            return Err(ProtocolError::from(format!("{} has a payload", operation.name())));
        }
        let rebuilt = Operation::from_payload(operation.operation_type(), &[])?;
        if rebuilt != operation {
            return Err(ProtocolError::from(format!("{} did not rebuild", operation.name())));
        }
    }
    Ok(())
}

#[test]
fn malformed_payload_is_reported() -> Result<(), ProtocolError> {
    let malformed = Operation::from_payload(OperationType::IsPhaseCompleted, b"{\"phase\":42}");
    if !matches!(
        malformed,
        Err(ProtocolError::DecodePayload {
            operation: "is_phase_completed",
            ..
        })
    ) {
        return Err(ProtocolError::from(format!("Unexpected result {:?}", malformed)));
    }
    let query = Operation::IsPhaseCompleted(PhaseQueryOperation {
        phase: TestPhase::GlobalVerify,
    });
    let payload = query.to_payload()?;
    if Operation::from_payload(OperationType::IsPhaseCompleted, &payload)? != query {
        return Err(ProtocolError::from("Phase query did not rebuild"));
    }
    Ok(())
}
