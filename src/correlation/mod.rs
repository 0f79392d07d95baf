//! Pending-response table keyed by `(id, source)`.
//!
//! A future is registered before its message is written and removed by the
//! first of: matching response, timeout, or loss of the connection it was
//! sent on. Removal from the map is the single point that decides which of
//! the three wins, so every future resolves exactly once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::Shared;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::CorrelationError;
use crate::protocol::{CorrelationKey, Response};


pub type ResponseOutcome = Result<Response, CorrelationError>;

struct PendingEntry {
    connection_id: Option<u64>,
    resolver: oneshot::Sender<ResponseOutcome>,
}

#[derive(Default)]
pub struct FutureTable {
    pending: DashMap<CorrelationKey, PendingEntry>,
}

impl FutureTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a pending response. `connection_id` is the link the message
    /// leaves on; `None` for messages answered without touching the wire.
    pub fn register(self: &Arc<Self>, key: CorrelationKey, connection_id: Option<u64>) -> ResponseFuture {
        let (resolver, receiver) = oneshot::channel();
        if self
            .pending
            .insert(
                key,
                PendingEntry {
                    connection_id,
                    resolver,
                },
            )
            .is_some()
        {
            debug!("Correlation key {} re-registered; previous waiter cancelled", key);
        }
        ResponseFuture {
            key,
            receiver: receiver.shared(),
            table: Arc::downgrade(self),
        }
    }

    /// Resolves the matching future. Hands the response back when no future
    /// is pending for its key, so the caller can forward or drop it.
    ///
    /// # Errors
    ///
    /// Returns the response unchanged when nothing is waiting for it.
    pub fn complete(&self, response: Response) -> Result<(), Box<Response>> {
        match self.pending.remove(&response.correlation_key()) {
            Some((_, entry)) => {
                if entry.resolver.send(Ok(response)).is_err() {
                    // Every waiter dropped its handle; the response has no reader.
                }
                Ok(())
            }
            None => Err(Box::new(response)),
        }
    }

    /// Fails every future registered through `connection_id`.
    pub fn fail_connection(&self, connection_id: u64) -> usize {
        let keys: Vec<CorrelationKey> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection_id == Some(connection_id))
            .map(|entry| *entry.key())
            .collect();
        let mut failed = 0_usize;
        for key in keys {
            if self.resolve_with(&key, |key| CorrelationError::ConnectionLost {
                key: key.to_string(),
            }) {
                failed = failed.saturating_add(1);
            }
        }
        failed
    }

    /// Removes `key` and fails its waiters with a timeout. Returns false when
    /// the future had already been resolved.
    pub fn expire(&self, key: &CorrelationKey) -> bool {
        self.resolve_with(key, |key| CorrelationError::Timeout {
            key: key.to_string(),
        })
    }

    /// Cancels everything still pending; used at shutdown.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<CorrelationKey> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0_usize;
        for key in keys {
            if self.resolve_with(&key, |key| CorrelationError::Cancelled {
                key: key.to_string(),
            }) {
                cancelled = cancelled.saturating_add(1);
            }
        }
        cancelled
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn resolve_with<F>(&self, key: &CorrelationKey, error: F) -> bool
    where
        F: FnOnce(&CorrelationKey) -> CorrelationError,
    {
        match self.pending.remove(key) {
            Some((key, entry)) => {
                if entry.resolver.send(Err(error(&key))).is_err() {
                    // No waiter left.
                }
                true
            }
            None => false,
        }
    }
}

/// Handle to a pending response. Clones share the same outcome.
#[derive(Clone)]
pub struct ResponseFuture {
    key: CorrelationKey,
    receiver: Shared<oneshot::Receiver<ResponseOutcome>>,
    table: Weak<FutureTable>,
}

impl ResponseFuture {
    #[must_use]
    pub const fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Outcome if already resolved.
    #[must_use]
    pub fn peek(&self) -> Option<ResponseOutcome> {
        self.receiver
            .clone()
            .now_or_never()
            .map(|outcome| outcome.unwrap_or_else(|_| Err(self.cancelled())))
    }

    /// Waits for the response. On timeout the key is removed from the table,
    /// so a response arriving later is treated as unmatched.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `ConnectionLost` or `Cancelled` when no matching
    /// response resolved the future.
    pub async fn await_response(&self, timeout: Duration) -> ResponseOutcome {
        if let Ok(outcome) = tokio::time::timeout(timeout, self.receiver.clone()).await {
            return outcome.unwrap_or_else(|_| Err(self.cancelled()));
        }
        if let Some(table) = self.table.upgrade() {
            table.expire(&self.key);
        }
        // Either the expiry above or a racing resolution has completed the
        // channel by now.
        self.receiver
            .clone()
            .await
            .unwrap_or_else(|_| Err(self.cancelled()))
    }

    fn cancelled(&self) -> CorrelationError {
        CorrelationError::Cancelled {
            key: self.key.to_string(),
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
