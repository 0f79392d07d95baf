use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::address::SimulatorAddress;
use crate::error::ConnectionError;
use crate::protocol::{Frame, FrameCodec};

use super::{ConnectionEvent, ConnectionHandle, ConnectorContext, SessionEnd, run_session};

/// Dialing side of one link. Frames sent while the session is being
/// re-established wait in the outbound queue.
pub struct ClientConnector {
    link: ConnectionHandle,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ClientConnector {
    /// Connects to `peer` at `endpoint`, retrying up to the configured
    /// attempt count, then keeps the link up in the background.
    ///
    /// # Errors
    ///
    /// Returns an error when every attempt failed.
    pub async fn connect(
        context: ConnectorContext,
        peer: SimulatorAddress,
        endpoint: &str,
    ) -> Result<Self, ConnectionError> {
        let (link, outbound, mut closed) = context.new_link(peer, endpoint.to_owned());
        let framed = connect_with_retry(&context, &link, &mut closed).await?;
        context.emit(ConnectionEvent::Opened(link.clone()));
        let task = tokio::spawn(supervise(
            context,
            link.clone(),
            framed,
            outbound,
            closed,
        ));
        Ok(Self {
            link,
            task: Mutex::new(Some(task)),
            shut_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn link(&self) -> &ConnectionHandle {
        &self.link
    }

    /// Flushes queued frames, closes the link and waits for the background
    /// task. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.close();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!("Client connector task for {} failed: {}", self.link.peer(), err);
        }
    }
}

async fn connect_with_retry(
    context: &ConnectorContext,
    link: &ConnectionHandle,
    closed: &mut watch::Receiver<bool>,
) -> Result<Framed<TcpStream, FrameCodec>, ConnectionError> {
    let settings = context.settings();
    let mut last_error = std::io::Error::other("no connection attempt made");
    for attempt in 1..=settings.connect_attempts {
        if *closed.borrow() {
            return Err(ConnectionError::ShutDown);
        }
        match try_connect(context, link).await {
            Ok(framed) => {
                info!(
                    "{} connected to {} at {} (attempt {})",
                    context.local(),
                    link.peer(),
                    link.endpoint(),
                    attempt
                );
                return Ok(framed);
            }
            Err(err) => {
                debug!(
                    "Connect attempt {}/{} to {} failed: {}",
                    attempt,
                    settings.connect_attempts,
                    link.endpoint(),
                    err
                );
                last_error = if let ConnectionError::Io { source, .. } = err {
                    source
                } else {
                    std::io::Error::other(err)
                };
            }
        }
        if attempt < settings.connect_attempts {
            tokio::select! {
                () = tokio::time::sleep(settings.connect_retry_delay) => {}
                _ = async { closed.wait_for(|closed| *closed).await.is_ok() } => {
                    return Err(ConnectionError::ShutDown);
                }
            }
        }
    }
    Err(ConnectionError::Connect {
        peer: link.peer().to_string(),
        addr: link.endpoint().to_owned(),
        attempts: settings.connect_attempts,
        source: last_error,
    })
}

async fn try_connect(
    context: &ConnectorContext,
    link: &ConnectionHandle,
) -> Result<Framed<TcpStream, FrameCodec>, ConnectionError> {
    let stream = TcpStream::connect(link.endpoint())
        .await
        .map_err(|source| ConnectionError::Io {
            context: "connect",
            source,
        })?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", link.endpoint(), err);
    }
    let mut framed = Framed::new(stream, context.codec());
    super::client_handshake(
        &mut framed,
        context.local(),
        link.peer(),
        context.settings().handshake_timeout,
    )
    .await?;
    Ok(framed)
}

async fn supervise(
    context: ConnectorContext,
    link: ConnectionHandle,
    mut framed: Framed<TcpStream, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<bool>,
) {
    let reason = loop {
        let end = run_session(framed, &link, &mut outbound, &mut closed, &context.events).await;
        match &end {
            SessionEnd::Closed => break end.to_string(),
            // A peer that sends garbage is broken; reconnecting would repeat it.
            SessionEnd::Protocol(err) => {
                warn!("Dropping link to {} after malformed frame: {}", link.peer(), err);
                break format!("protocol error: {}", err);
            }
            SessionEnd::PeerClosed | SessionEnd::Io(_) => {
                warn!("Link to {} lost ({}); reconnecting", link.peer(), end);
                context.emit(ConnectionEvent::SessionLost {
                    link: link.clone(),
                    reason: end.to_string(),
                });
            }
        }
        framed = match connect_with_retry(&context, &link, &mut closed).await {
            Ok(framed) => framed,
            Err(ConnectionError::ShutDown) => break "closed locally".to_owned(),
            Err(err) => {
                warn!("Giving up on {}: {}", link.peer(), err);
                link.close();
                context.emit(ConnectionEvent::Unreachable {
                    link: link.clone(),
                    reason: err.to_string(),
                });
                return;
            }
        };
        context.emit(ConnectionEvent::Opened(link.clone()));
    };
    link.close();
    context.emit(ConnectionEvent::Closed { link, reason });
}
