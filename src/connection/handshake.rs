use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::address::SimulatorAddress;
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{Frame, FrameCodec, Message, OperationType, ResultCode};

/// Message id reserved for `Identify`; regular traffic starts at 1.
const HANDSHAKE_ID: i64 = 0;

/// A node accepts its parent and its direct children.
#[must_use]
pub fn accepts_peer(local: SimulatorAddress, peer: SimulatorAddress) -> bool {
    local.parent().is_ok_and(|parent| parent == peer)
        || peer.parent().is_ok_and(|parent| parent == local)
}

fn io_error(context: &'static str, err: ProtocolError) -> ConnectionError {
    if let ProtocolError::Io { source } = err {
        return ConnectionError::Io { context, source };
    }
    ConnectionError::Io {
        context,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
    }
}

/// Identifies `local` to the listening `peer` and waits for its verdict.
///
/// # Errors
///
/// Returns an error if the peer rejects us, closes, or stays silent past
/// `timeout`.
pub async fn client_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    local: SimulatorAddress,
    peer: SimulatorAddress,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let identify = Message {
        source: local,
        destination: peer,
        id: HANDSHAKE_ID,
        operation_type: OperationType::Identify,
        payload: Bytes::new(),
    };
    let exchange = async {
        framed
            .send(Frame::Message(identify))
            .await
            .map_err(|err| io_error("send identify", err))?;
        match framed.next().await {
            Some(Ok(Frame::Response(response))) if response.id == HANDSHAKE_ID => {
                if response.result_code.is_success() {
                    Ok(())
                } else {
                    Err(ConnectionError::HandshakeRejected {
                        peer: peer.to_string(),
                        reason: format!("{:?}: {}", response.result_code, response.payload_text()),
                    })
                }
            }
            Some(Ok(_)) => Err(ConnectionError::HandshakeRejected {
                peer: peer.to_string(),
                reason: "unexpected frame before identify response".to_owned(),
            }),
            Some(Err(err)) => Err(io_error("read identify response", err)),
            None => Err(ConnectionError::ConnectionLost {
                peer: peer.to_string(),
            }),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_err| ConnectionError::HandshakeTimeout {
            peer: peer.to_string(),
        })?
}

/// Waits for the dialing side's `Identify` and answers it. Returns the
/// peer's address when it may talk to `local`.
///
/// # Errors
///
/// Returns an error on silence past `timeout`, a first frame that is not
/// `Identify`, or an address `local` does not accept.
pub async fn server_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    local: SimulatorAddress,
    timeout: Duration,
) -> Result<SimulatorAddress, ConnectionError> {
    let remote = framed
        .get_ref()
        .peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());
    let exchange = async {
        let message = match framed.next().await {
            Some(Ok(Frame::Message(message)))
                if message.operation_type == OperationType::Identify =>
            {
                message
            }
            Some(Ok(_)) => {
                return Err(ConnectionError::HandshakeRejected {
                    peer: remote.clone(),
                    reason: "first frame was not identify".to_owned(),
                });
            }
            Some(Err(err)) => return Err(io_error("read identify", err)),
            None => {
                return Err(ConnectionError::ConnectionLost {
                    peer: remote.clone(),
                });
            }
        };
        let accepted = message.destination == local && accepts_peer(local, message.source);
        let (code, payload) = if accepted {
            (ResultCode::Success, Bytes::new())
        } else {
            (
                ResultCode::FailureInvalidAddress,
                Bytes::from(format!(
                    "{} does not accept {} (addressed to {})",
                    local, message.source, message.destination
                )),
            )
        };
        framed
            .send(Frame::Response(message.reply(local, code, payload)))
            .await
            .map_err(|err| io_error("send identify response", err))?;
        if accepted {
            Ok(message.source)
        } else {
            Err(ConnectionError::HandshakeRejected {
                peer: message.source.to_string(),
                reason: format!("not a neighbour of {}", local),
            })
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_err| ConnectionError::HandshakeTimeout {
            peer: remote.clone(),
        })?
}
