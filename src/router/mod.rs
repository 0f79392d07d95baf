//! Hop-by-hop forwarding through the coordinator -> agent -> worker -> test
//! tree.
//!
//! Every node holds links to its parent and its direct children, keyed by
//! the peer address. A message goes to the link of the next address on the
//! path to its destination; a response goes to the local future table first
//! and is otherwise forwarded the same way toward the original sender. A
//! missing hop never drops a message: the router answers it with a failure
//! response on the spot.
mod handler;
mod transport;


use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::address::{AddressLevel, SimulatorAddress};
use crate::connection::{ConnectionEvent, ConnectionHandle, EventReceiver};
use crate::correlation::{FutureTable, ResponseFuture};
use crate::error::{AppError, AppResult, RoutingError};
use crate::protocol::{Frame, Message, Operation, OperationType, Response, ResultCode};
use crate::system::shutdown::{ShutdownReceiver, wait_for_shutdown};

pub use handler::{OperationHandler, Reply, Request};

/// Where a frame goes next from this node.
#[derive(Debug, Clone)]
pub enum Hop {
    Local,
    Link(ConnectionHandle),
    Unroutable(ResultCode),
}

pub struct Router {
    local: SimulatorAddress,
    this: Weak<Router>,
    handler: Arc<dyn OperationHandler>,
    links: DashMap<SimulatorAddress, ConnectionHandle>,
    futures: Arc<FutureTable>,
    next_id: AtomicI64,
    response_timeout: Duration,
}

impl Router {
    #[must_use]
    pub fn new(
        local: SimulatorAddress,
        handler: Arc<dyn OperationHandler>,
        response_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            this: this.clone(),
            handler,
            links: DashMap::new(),
            futures: FutureTable::new(),
            next_id: AtomicI64::new(0),
            response_timeout,
        })
    }

    #[must_use]
    pub const fn local(&self) -> SimulatorAddress {
        self.local
    }

    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    #[must_use]
    pub fn pending_responses(&self) -> usize {
        self.futures.len()
    }

    #[must_use]
    pub fn link(&self, peer: &SimulatorAddress) -> Option<ConnectionHandle> {
        self.links.get(peer).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn peers(&self) -> Vec<SimulatorAddress> {
        let mut peers: Vec<SimulatorAddress> = self.links.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }

    /// Consumes connection events until shutdown or until every connector
    /// is gone, then fails whatever is still pending.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver, mut shutdown_rx: ShutdownReceiver) {
        loop {
            let event = tokio::select! {
                () = wait_for_shutdown(&mut shutdown_rx) => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.on_event(event).await;
        }
        let cancelled = self.futures.cancel_all();
        if cancelled > 0 {
            debug!("{} cancelled {} pending response(s)", self.local, cancelled);
        }
        for link in self.links.iter() {
            link.close();
        }
    }

    async fn on_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened(link) => {
                debug!("{} link {} to {} open", self.local, link.id(), link.peer());
                self.links.insert(link.peer(), link);
            }
            ConnectionEvent::Frame { link, frame } => {
                self.handler.observe(link.peer());
                match frame {
                    Frame::Message(message) => self.on_message(message).await,
                    Frame::Response(response) => self.route_response(response).await,
                }
            }
            ConnectionEvent::SessionLost { link, reason } => {
                let failed = self.futures.fail_connection(link.id());
                info!(
                    "{} lost session to {} ({}); failed {} pending response(s)",
                    self.local,
                    link.peer(),
                    reason,
                    failed
                );
            }
            ConnectionEvent::Closed { link, reason } | ConnectionEvent::Unreachable { link, reason } => {
                let failed = self.futures.fail_connection(link.id());
                let removed = self
                    .links
                    .remove_if(&link.peer(), |_, current| current.id() == link.id())
                    .is_some();
                info!(
                    "{} link to {} closed: {} ({} pending response(s) failed)",
                    self.local,
                    link.peer(),
                    reason,
                    failed
                );
                if removed {
                    let router = self.clone();
                    tokio::spawn(async move {
                        router
                            .handler
                            .link_closed(&router, link.peer(), &reason)
                            .await;
                    });
                }
            }
        }
    }

    /// Next hop toward `destination`. A worker hosts its tests, so test
    /// addresses below it are local.
    #[must_use]
    pub fn next_hop(&self, destination: &SimulatorAddress) -> Hop {
        if *destination == self.local {
            return Hop::Local;
        }
        if self.local.is_ancestor_of(destination) {
            if self.local.level() == AddressLevel::Worker {
                return Hop::Local;
            }
            let child = self
                .local
                .child_index_toward(destination)
                .and_then(|index| self.local.child(index).ok());
            let Some(child) = child else {
                return Hop::Unroutable(ResultCode::FailureInvalidAddress);
            };
            return match self.link(&child) {
                Some(link) => Hop::Link(link),
                None => Hop::Unroutable(missing_code(child.level())),
            };
        }
        match self.local.parent() {
            Ok(parent) => self
                .link(&parent)
                .map_or(Hop::Unroutable(ResultCode::FailureConnectionLost), Hop::Link),
            Err(_) => Hop::Unroutable(ResultCode::FailureInvalidAddress),
        }
    }

    /// Sends `operation` to `destination` and returns the pending response.
    /// Unroutable destinations resolve immediately with a failure response.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be serialized.
    pub async fn send(
        &self,
        destination: SimulatorAddress,
        operation: &Operation,
    ) -> AppResult<ResponseFuture> {
        let message = Message {
            source: self.local,
            destination,
            id: self.next_id.fetch_add(1, Ordering::Relaxed).saturating_add(1),
            operation_type: operation.operation_type(),
            payload: operation.to_payload()?,
        };
        let key = message.correlation_key();
        match self.next_hop(&destination) {
            Hop::Link(link) => {
                let future = self.futures.register(key, Some(link.id()));
                if let Err(err) = link.send(Frame::Message(message.clone())).await {
                    self.resolve_locally(message.reply(
                        self.local,
                        ResultCode::FailureConnectionLost,
                        Bytes::from(err.to_string()),
                    ));
                }
                Ok(future)
            }
            Hop::Local => {
                let future = self.futures.register(key, None);
                if let Some(router) = self.this.upgrade() {
                    tokio::spawn(async move {
                        router.handle_local(message).await;
                    });
                }
                Ok(future)
            }
            Hop::Unroutable(code) => {
                let future = self.futures.register(key, None);
                let text = self.unroutable_text(&destination);
                debug!("{}", text);
                self.resolve_locally(message.reply(self.local, code, Bytes::from(text)));
                Ok(future)
            }
        }
    }

    /// Sends and waits up to the response timeout. Any result code is
    /// returned as-is.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization failure, timeout, or link loss.
    pub async fn request(
        &self,
        destination: SimulatorAddress,
        operation: &Operation,
    ) -> AppResult<Response> {
        let future = self.send(destination, operation).await?;
        Ok(future.await_response(self.response_timeout).await?)
    }

    /// Like [`request`](Self::request) but only accepts `Success` and
    /// returns the reply payload.
    ///
    /// # Errors
    ///
    /// Returns a `RoutingError::Rejected` for any other result code.
    pub async fn call(&self, destination: SimulatorAddress, operation: &Operation) -> AppResult<Bytes> {
        let response = self.request(destination, operation).await?;
        if response.result_code.is_success() {
            return Ok(response.payload);
        }
        Err(AppError::routing(RoutingError::Rejected {
            destination: destination.to_string(),
            code: response.result_code,
            message: response.payload_text(),
        }))
    }

    async fn on_message(self: &Arc<Self>, message: Message) {
        match self.next_hop(&message.destination) {
            Hop::Local => {
                let router = self.clone();
                tokio::spawn(async move {
                    router.handle_local(message).await;
                });
            }
            Hop::Link(link) => {
                let peer = link.peer();
                if let Err(err) = link.send(Frame::Message(message.clone())).await {
                    warn!("{} failed to forward to {}: {}", self.local, peer, err);
                    let response = message.reply(
                        self.local,
                        ResultCode::FailureConnectionLost,
                        Bytes::from(err.to_string()),
                    );
                    self.route_response(response).await;
                }
            }
            Hop::Unroutable(code) => {
                let text = self.unroutable_text(&message.destination);
                debug!("{}; answering {:?}", text, code);
                let response = message.reply(self.local, code, Bytes::from(text));
                self.route_response(response).await;
            }
        }
    }

    async fn handle_local(self: Arc<Self>, message: Message) {
        let operation_type = message.operation_type;
        // Links are identified during the handshake; later frames are plain
        // liveness traffic.
        let reply = if matches!(operation_type, OperationType::Identify | OperationType::Ping) {
            Reply::success()
        } else {
            match Operation::from_payload(operation_type, &message.payload) {
                Ok(operation) => {
                    let request = Request {
                        source: message.source,
                        destination: message.destination,
                        operation,
                    };
                    self.handler.handle(&self, request).await
                }
                Err(err) => {
                    warn!("{} rejected {:?}: {}", self.local, operation_type, err);
                    Reply::from_protocol_error(&err)
                }
            }
        };
        let response = message.reply(self.local, reply.code, reply.payload);
        self.route_response(response).await;
    }

    /// Completes the local future for `response`, or forwards it toward its
    /// destination when this node is a pass-through hop.
    pub async fn route_response(&self, response: Response) {
        let response = match self.futures.complete(response) {
            Ok(()) => return,
            Err(response) => *response,
        };
        match self.next_hop(&response.destination) {
            Hop::Link(link) => {
                let peer = link.peer();
                if let Err(err) = link.send(Frame::Response(response)).await {
                    warn!("{} dropped response for {}: {}", self.local, peer, err);
                }
            }
            Hop::Local => debug!(
                "{} dropping response {} with no pending future",
                self.local,
                response.correlation_key()
            ),
            Hop::Unroutable(code) => warn!(
                "{} cannot return response {} ({:?})",
                self.local,
                response.correlation_key(),
                code
            ),
        }
    }

    fn resolve_locally(&self, response: Response) {
        if let Err(response) = self.futures.complete(response) {
            debug!(
                "{} response {} already resolved",
                self.local,
                response.correlation_key()
            );
        }
    }

    fn unroutable_text(&self, destination: &SimulatorAddress) -> String {
        RoutingError::Unroutable {
            local: self.local.to_string(),
            destination: destination.to_string(),
        }
        .to_string()
    }
}

const fn missing_code(level: AddressLevel) -> ResultCode {
    match level {
        AddressLevel::Agent => ResultCode::FailureAgentNotFound,
        AddressLevel::Worker => ResultCode::FailureWorkerNotFound,
        AddressLevel::Test => ResultCode::FailureTestNotFound,
        AddressLevel::Root => ResultCode::FailureInvalidAddress,
    }
}
