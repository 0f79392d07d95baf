//! TCP links between adjacent levels of the hierarchy.
//!
//! Lower levels listen and upper levels dial: the agent runs a
//! [`ServerConnector`] that accepts its coordinator and its workers, while
//! the coordinator and workers hold one [`ClientConnector`] per upstream or
//! downstream peer they dial. Both kinds report through one
//! [`ConnectionEvent`] stream consumed by the router.
mod client;
mod handshake;
mod server;


use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::address::SimulatorAddress;
use crate::config::ConnectionSettings;
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{Frame, FrameCodec};

pub use client::ClientConnector;
pub use handshake::{accepts_peer, client_handshake, server_handshake};
pub use server::ServerConnector;

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Link lifecycle and inbound traffic, in arrival order per link.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed; also sent again after a client reconnects.
    Opened(ConnectionHandle),
    Frame {
        link: ConnectionHandle,
        frame: Frame,
    },
    /// A client session dropped and is being re-established. Futures sent on
    /// the old session are failed; queued frames survive.
    SessionLost {
        link: ConnectionHandle,
        reason: String,
    },
    /// The link is gone for good.
    Closed {
        link: ConnectionHandle,
        reason: String,
    },
    /// Reconnect retries were exhausted.
    Unreachable {
        link: ConnectionHandle,
        reason: String,
    },
}

/// Per-node state shared by every connector of that node.
#[derive(Clone)]
pub struct ConnectorContext {
    local: SimulatorAddress,
    settings: ConnectionSettings,
    events: EventSender,
    link_ids: Arc<AtomicU64>,
}

impl ConnectorContext {
    #[must_use]
    pub fn new(local: SimulatorAddress, settings: ConnectionSettings, events: EventSender) -> Self {
        Self {
            local,
            settings,
            events,
            link_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub const fn local(&self) -> SimulatorAddress {
        self.local
    }

    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.settings.max_frame_bytes)
    }

    fn next_link_id(&self) -> u64 {
        self.link_ids.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            // Router is gone; nothing left to notify.
        }
    }

    fn new_link(
        &self,
        peer: SimulatorAddress,
        endpoint: String,
    ) -> (ConnectionHandle, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(self.settings.outbound_queue_capacity);
        let (closed, closed_rx) = watch::channel(false);
        let handle = ConnectionHandle {
            inner: Arc::new(LinkInner {
                id: self.next_link_id(),
                peer,
                endpoint,
                outbound,
                closed,
            }),
        };
        (handle, outbound_rx, closed_rx)
    }
}

struct LinkInner {
    id: u64,
    peer: SimulatorAddress,
    endpoint: String,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

/// Cheap, cloneable handle on one link. Sending waits when the outbound
/// queue is full.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<LinkInner>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn peer(&self) -> SimulatorAddress {
        self.inner.peer
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// # Errors
    ///
    /// Returns `ConnectionLost` once the link is closed.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(self.lost());
        }
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_err| self.lost())
    }

    /// Flushes queued frames and closes the link. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.inner.closed.send_replace(true) {
            debug!("Closing link {} to {}", self.inner.id, self.inner.peer);
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    fn lost(&self) -> ConnectionError {
        ConnectionError::ConnectionLost {
            peer: self.inner.peer.to_string(),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum SessionEnd {
    /// Local close; queued frames were flushed.
    Closed,
    PeerClosed,
    Io(std::io::Error),
    Protocol(ProtocolError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Closed => f.write_str("closed locally"),
            SessionEnd::PeerClosed => f.write_str("closed by peer"),
            SessionEnd::Io(err) => write!(f, "I/O error: {}", err),
            SessionEnd::Protocol(err) => write!(f, "protocol error: {}", err),
        }
    }
}

/// Pumps one established session until either direction ends it. Reading
/// and writing progress independently so a full socket buffer in one
/// direction never stalls the other.
async fn run_session(
    framed: Framed<TcpStream, FrameCodec>,
    link: &ConnectionHandle,
    outbound: &mut mpsc::Receiver<Frame>,
    closed: &mut watch::Receiver<bool>,
    events: &EventSender,
) -> SessionEnd {
    let (mut sink, mut stream) = framed.split();

    let read_loop = async {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    let event = ConnectionEvent::Frame {
                        link: link.clone(),
                        frame,
                    };
                    if events.send(event).is_err() {
                        return SessionEnd::Closed;
                    }
                }
                Some(Err(ProtocolError::Io { source })) => return SessionEnd::Io(source),
                Some(Err(err)) => return SessionEnd::Protocol(err),
                None => return SessionEnd::PeerClosed,
            }
        }
    };

    let write_loop = async {
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Closed;
                    };
                    if let Err(err) = sink.send(frame).await {
                        if let ProtocolError::Io { source } = err {
                            return SessionEnd::Io(source);
                        }
                        return SessionEnd::Protocol(err);
                    }
                }
                requested = async { closed.wait_for(|closed| *closed).await.is_ok() } => {
                    if requested {
                        while let Ok(frame) = outbound.try_recv() {
                            if sink.feed(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    if sink.close().await.is_err() {
                        // Peer already went away; nothing left to flush.
                    }
                    return SessionEnd::Closed;
                }
            }
        }
    };

    tokio::select! {
        end = read_loop => end,
        end = write_loop => end,
    }
}
