use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

use super::{ConnectionEvent, ConnectionHandle, ConnectorContext, SessionEnd, run_session};

type Sessions = Arc<Mutex<JoinSet<()>>>;

/// Accepting side of the links that end at this node.
pub struct ServerConnector {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    links: Arc<DashMap<u64, ConnectionHandle>>,
    sessions: Sessions,
    closing: Arc<AtomicBool>,
}

impl ServerConnector {
    /// Binds `listen` and starts accepting. Every accepted socket must
    /// identify itself within the handshake timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(context: ConnectorContext, listen: &str) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: listen.to_owned(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ConnectionError::Io {
            context: "read listener address",
            source,
        })?;
        info!("{} listening on {}", context.local(), local_addr);
        let links: Arc<DashMap<u64, ConnectionHandle>> = Arc::new(DashMap::new());
        let sessions: Sessions = Arc::default();
        let closing = Arc::new(AtomicBool::new(false));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            context,
            Served {
                links: links.clone(),
                sessions: sessions.clone(),
                closing: closing.clone(),
            },
        ));
        Ok(Self {
            local_addr,
            accept_task,
            links,
            sessions,
            closing,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Stops accepting, closes every accepted link and waits until each
    /// link has flushed its queued frames. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.close();
        let mut sessions = std::mem::take(&mut *self.lock_sessions());
        while let Some(result) = sessions.join_next().await {
            if let Err(err) = result {
                warn!("Session on {} ended abnormally: {}", self.local_addr, err);
            }
        }
        debug!("Server connector on {} shut down", self.local_addr);
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accept_task.abort();
        for link in self.links.iter() {
            link.close();
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ServerConnector {
    fn drop(&mut self) {
        self.close();
        // Closed sessions still drain on their own.
        std::mem::take(&mut *self.lock_sessions()).detach_all();
    }
}

/// State the accept loop shares with the connector.
struct Served {
    links: Arc<DashMap<u64, ConnectionHandle>>,
    sessions: Sessions,
    closing: Arc<AtomicBool>,
}

async fn accept_loop(listener: TcpListener, context: ConnectorContext, served: Served) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(result) => result,
            Err(err) => {
                warn!("Failed to accept connection: {}", err);
                continue;
            }
        };
        let context = context.clone();
        let links = served.links.clone();
        let closing = served.closing.clone();
        let mut sessions = served.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        while sessions.try_join_next().is_some() {}
        sessions.spawn(async move {
            serve_connection(stream, remote, context, links, &closing).await;
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    context: ConnectorContext,
    links: Arc<DashMap<u64, ConnectionHandle>>,
    closing: &AtomicBool,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", remote, err);
    }
    let mut framed = Framed::new(stream, context.codec());
    let peer = match super::server_handshake(
        &mut framed,
        context.local(),
        context.settings().handshake_timeout,
    )
    .await
    {
        Ok(peer) => peer,
        Err(err) => {
            warn!("Closing connection from {}: {}", remote, err);
            return;
        }
    };
    if closing.load(Ordering::Acquire) {
        debug!("Dropping {} from {}: connector is shutting down", peer, remote);
        return;
    }
    info!("{} accepted {} from {}", context.local(), peer, remote);

    let (link, mut outbound, mut closed) = context.new_link(peer, remote.to_string());
    links.insert(link.id(), link.clone());
    context.emit(ConnectionEvent::Opened(link.clone()));
    let end = run_session(framed, &link, &mut outbound, &mut closed, &context.events).await;
    links.remove(&link.id());
    link.close();
    match &end {
        SessionEnd::Protocol(err) => warn!("Dropping {} after malformed frame: {}", peer, err),
        SessionEnd::Io(err) => warn!("Link to {} failed: {}", peer, err),
        SessionEnd::Closed | SessionEnd::PeerClosed => info!("Link to {} {}", peer, end),
    }
    context.emit(ConnectionEvent::Closed {
        link,
        reason: end.to_string(),
    });
}
