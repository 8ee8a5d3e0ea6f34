//! Outbound side of the transport adapter.
//!
//! The recovery core never touches sockets. It hands events to a
//! [`Transport`] keyed by connection id; the adapter owns framing, heartbeats
//! and reconnect scheduling.

use crate::session::events::ServerEvent;
use crate::session::state::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("send to {connection} failed: {reason}")]
    SendFailed {
        connection: ConnectionId,
        reason: String,
    },
}

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

pub trait Transport: Send + Sync + 'static {
    /// Deliver one event. Sends to the same connection must be issued by a
    /// single caller at a time so the adapter sees them in order.
    fn send(&self, connection: ConnectionId, event: ServerEvent) -> SendFuture<'_>;
}

/// In-memory transport that records every event. Used by tests and the
/// `replay` command.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    inner: Mutex<Recording>,
}

#[derive(Debug, Default)]
struct Recording {
    sent: Vec<(ConnectionId, ServerEvent)>,
    fail_next: u32,
    closed: HashSet<ConnectionId>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with `SendFailed`.
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().fail_next = count;
    }

    /// Refuse every later send to `connection`.
    pub fn close(&self, connection: ConnectionId) {
        self.inner.lock().closed.insert(connection);
    }

    pub fn sent(&self) -> Vec<(ConnectionId, ServerEvent)> {
        self.inner.lock().sent.clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<(ConnectionId, ServerEvent)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn events_for(&self, connection: ConnectionId) -> Vec<ServerEvent> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(conn, _)| *conn == connection)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, connection: ConnectionId, event: ServerEvent) -> SendFuture<'_> {
        let result = {
            let mut inner = self.inner.lock();
            if inner.closed.contains(&connection) {
                Err(TransportError::Closed(connection))
            } else if inner.fail_next > 0 {
                inner.fail_next -= 1;
                Err(TransportError::SendFailed {
                    connection,
                    reason: "injected failure".to_string(),
                })
            } else {
                inner.sent.push((connection, event));
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

/// Forwards events into a bounded channel drained by the adapter's writer
/// task, which serializes sends per connection.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<(ConnectionId, ServerEvent)>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(ConnectionId, ServerEvent)>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, connection: ConnectionId, event: ServerEvent) -> SendFuture<'_> {
        Box::pin(async move {
            self.tx
                .send((connection, event))
                .await
                .map_err(|_| TransportError::Closed(connection))
        })
    }
}
