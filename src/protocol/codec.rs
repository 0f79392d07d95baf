use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::address::{AddressLevel, SimulatorAddress};
use crate::error::ProtocolError;

use super::types::{Frame, FrameKind, Message, OperationType, Response, ResultCode};

const LENGTH_PREFIX_BYTES: usize = 4;
const ADDRESS_BYTES: usize = 13;
/// Fixed bytes after the length prefix: kind, two addresses, id, code and
/// payload length.
pub const FRAME_HEADER_BYTES: usize = 1 + ADDRESS_BYTES * 2 + 8 + 4 + 4;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Appends one length-prefixed frame to `dst`.
///
/// # Errors
///
/// Returns an error when the encoded frame would exceed `max_frame_bytes`.
pub fn encode_frame(
    frame: &Frame,
    dst: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError> {
    let (source, destination, id, code, payload) = match frame {
        Frame::Message(message) => (
            message.source,
            message.destination,
            message.id,
            message.operation_type.code(),
            &message.payload,
        ),
        Frame::Response(response) => (
            response.source,
            response.destination,
            response.id,
            response.result_code.code(),
            &response.payload,
        ),
    };
    let length = FRAME_HEADER_BYTES.saturating_add(payload.len());
    if length > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            length,
            max: max_frame_bytes,
        });
    }
    let (Ok(length_field), Ok(payload_field)) =
        (u32::try_from(length), u32::try_from(payload.len()))
    else {
        return Err(ProtocolError::FrameTooLarge {
            length,
            max: max_frame_bytes,
        });
    };

    dst.reserve(LENGTH_PREFIX_BYTES.saturating_add(length));
    dst.put_u32(length_field);
    dst.put_u8(frame.kind().code());
    put_address(dst, &source);
    put_address(dst, &destination);
    dst.put_i64(id);
    dst.put_i32(code);
    dst.put_u32(payload_field);
    dst.put_slice(payload);
    Ok(())
}

/// Splits one complete frame off the front of `src`.
///
/// Returns `Ok(None)` while the buffer holds only a partial frame. The payload
/// shares the buffer's allocation.
///
/// # Errors
///
/// Returns an error for frames with an invalid length, kind, address, code or
/// payload length. The stream cannot be resynchronized after an error.
pub fn decode_frame(
    src: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, ProtocolError> {
    let Some(prefix) = src.get(..LENGTH_PREFIX_BYTES) else {
        return Ok(None);
    };
    let mut prefix = prefix;
    let length = usize::try_from(prefix.get_u32()).unwrap_or(usize::MAX);
    if length < FRAME_HEADER_BYTES {
        return Err(ProtocolError::FrameTooShort {
            length,
            min: FRAME_HEADER_BYTES,
        });
    }
    if length > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            length,
            max: max_frame_bytes,
        });
    }
    let total = LENGTH_PREFIX_BYTES.saturating_add(length);
    if src.len() < total {
        src.reserve(total.saturating_sub(src.len()));
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_BYTES);
    let mut body: Bytes = src.split_to(length).freeze();
    let kind = FrameKind::from_code(body.get_u8())?;
    let source = get_address(&mut body, "source")?;
    let destination = get_address(&mut body, "destination")?;
    let id = body.get_i64();
    let code = body.get_i32();
    let declared = usize::try_from(body.get_u32()).unwrap_or(usize::MAX);
    if declared != body.remaining() {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            remaining: body.remaining(),
        });
    }
    let payload = body;

    let frame = match kind {
        FrameKind::Message => Frame::Message(Message {
            source,
            destination,
            id,
            operation_type: OperationType::from_code(code)?,
            payload,
        }),
        FrameKind::Response => Frame::Response(Response {
            id,
            source,
            destination,
            result_code: ResultCode::from_code(code)?,
            payload,
        }),
    };
    Ok(Some(frame))
}

fn put_address(dst: &mut BytesMut, address: &SimulatorAddress) {
    dst.put_i8(address.level().code());
    dst.put_u32(address.agent_index());
    dst.put_u32(address.worker_index());
    dst.put_u32(address.test_index());
}

fn get_address(src: &mut Bytes, field: &'static str) -> Result<SimulatorAddress, ProtocolError> {
    let level = AddressLevel::from_code(src.get_i8())
        .map_err(|source| ProtocolError::InvalidAddress { field, source })?;
    let agent_index = src.get_u32();
    let worker_index = src.get_u32();
    let test_index = src.get_u32();
    SimulatorAddress::new(level, agent_index, worker_index, test_index)
        .map_err(|source| ProtocolError::InvalidAddress { field, source })
}

/// `tokio_util` adapter over [`encode_frame`] / [`decode_frame`].
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_frame_bytes)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst, self.max_frame_bytes)
    }
}
