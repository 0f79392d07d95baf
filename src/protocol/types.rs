use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::address::SimulatorAddress;
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    Response,
}

impl FrameKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            FrameKind::Message => 1,
            FrameKind::Response => 2,
        }
    }

    /// # Errors
    ///
    /// Returns an error for unknown frame kinds.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(FrameKind::Message),
            2 => Ok(FrameKind::Response),
            _ => Err(ProtocolError::UnknownFrameKind { kind: code }),
        }
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $error:ident {
            $($variant:ident = $code:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub const fn code(self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// # Errors
            ///
            /// Returns an error for codes not defined by the protocol.
            pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
                match code {
                    $($code => Ok($name::$variant),)+
                    _ => Err(ProtocolError::$error { code }),
                }
            }
        }
    };
}

wire_enum! {
    /// Fixed operation set carried by `Message` frames.
    OperationType, UnknownOperationType {
        Identify = 1,
        Ping = 2,
        CreateWorker = 10,
        TerminateWorker = 11,
        StartTimeoutDetection = 12,
        StopTimeoutDetection = 13,
        IgnoreWorkerFailure = 14,
        CreateTest = 20,
        StartTestPhase = 21,
        IsPhaseCompleted = 22,
        StopTest = 23,
        Failure = 30,
        PerformanceState = 31,
    }
}

wire_enum! {
    /// Outcome carried by `Response` frames.
    ResultCode, UnknownResultCode {
        Success = 0,
        ExceptionDuringOperationExecution = 1,
        ExceptionUnsupportedOperation = 2,
        FailureAgentNotFound = 10,
        FailureWorkerNotFound = 11,
        FailureTestNotFound = 12,
        FailureInvalidAddress = 13,
        FailureConnectionLost = 14,
    }
}

impl ResultCode {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }

    /// Codes synthesized by routers when a hop is missing.
    #[must_use]
    pub const fn is_routing_failure(self) -> bool {
        matches!(
            self,
            ResultCode::FailureAgentNotFound
                | ResultCode::FailureWorkerNotFound
                | ResultCode::FailureTestNotFound
                | ResultCode::FailureInvalidAddress
                | ResultCode::FailureConnectionLost
        )
    }
}

/// `(id, source)` pair that ties a response back to its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub id: i64,
    pub source: SimulatorAddress,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id, self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: SimulatorAddress,
    pub destination: SimulatorAddress,
    pub id: i64,
    pub operation_type: OperationType,
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub const fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            id: self.id,
            source: self.source,
        }
    }

    /// Builds the response for this message, addressed back to its source.
    #[must_use]
    pub fn reply(&self, responder: SimulatorAddress, result_code: ResultCode, payload: Bytes) -> Response {
        Response {
            id: self.id,
            source: responder,
            destination: self.source,
            result_code,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: i64,
    /// Node that produced the response (the target, or a hop that failed to
    /// route).
    pub source: SimulatorAddress,
    /// Source of the originating message.
    pub destination: SimulatorAddress,
    pub result_code: ResultCode,
    pub payload: Bytes,
}

impl Response {
    #[must_use]
    pub const fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            id: self.id,
            source: self.destination,
        }
    }

    /// Payload interpreted as UTF-8 text, used for failure details.
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Message),
    Response(Response),
}

impl Frame {
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Frame::Message(_) => FrameKind::Message,
            Frame::Response(_) => FrameKind::Response,
        }
    }

    #[must_use]
    pub const fn destination(&self) -> SimulatorAddress {
        match self {
            Frame::Message(message) => message.destination,
            Frame::Response(response) => response.destination,
        }
    }
}
