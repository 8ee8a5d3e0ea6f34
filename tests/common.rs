//! Shared harness for integration tests.
//!
//! Wires a [`RecoveryCoordinator`] to a manual clock and a recording
//! transport, and routes server events back into [`RecoveryClient`]s so a
//! test can play both sides of the handshake.

// Not all test files use all helpers.
#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether::config::Config;
use tether::session::{
    ClientMessage, ConnectionId, RecordingTransport, RecoveryClient, RecoveryCoordinator,
    ServerEvent, SessionId, TransportEvent,
};
use tether::time::ManualClock;
use tether::RecoveryError;

pub type Coordinator = RecoveryCoordinator<ManualClock, RecordingTransport>;

pub struct Harness {
    pub clock: ManualClock,
    pub transport: Arc<RecordingTransport>,
    pub coordinator: Coordinator,
    stash: Mutex<Vec<(ConnectionId, ServerEvent)>>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let clock = ManualClock::new();
        let transport = Arc::new(RecordingTransport::new());
        let coordinator = RecoveryCoordinator::new(config, clock.clone(), transport.clone());
        Self {
            clock,
            transport,
            coordinator,
            stash: Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Config::default())
    }

    pub async fn handle(&self, event: TransportEvent) -> Result<(), RecoveryError> {
        self.coordinator.handle(event).await
    }

    pub async fn send(&self, connection: u64, message: ClientMessage) {
        self.handle(TransportEvent::Message {
            connection: ConnectionId(connection),
            message,
        })
        .await
        .expect("connection is bound");
    }

    pub async fn disconnect(&self, connection: u64) {
        self.handle(TransportEvent::Disconnected {
            connection: ConnectionId(connection),
            reason: "socket closed".into(),
        })
        .await
        .expect("disconnect");
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> usize {
        self.coordinator.publish(topic.into(), payload, None).await
    }

    pub async fn advance_and_tick(&self, by: Duration) {
        self.clock.advance(by);
        self.coordinator.tick().await;
    }

    /// Events recorded for `connection` since the last drain.
    pub fn drain(&self, connection: u64) -> Vec<ServerEvent> {
        let mut stash = self.stash.lock();
        stash.extend(self.transport.take());
        let (mine, rest): (Vec<_>, Vec<_>) = stash
            .drain(..)
            .partition(|(conn, _)| *conn == ConnectionId(connection));
        *stash = rest;
        mine.into_iter().map(|(_, event)| event).collect()
    }

    /// Connect `client` on `connection` and play the handshake to quiescence.
    pub async fn connect(&self, client: &mut RecoveryClient, connection: u64) -> Vec<ServerEvent> {
        let event = client.connect(ConnectionId(connection));
        // Duplicate resumes are reported on the connection itself.
        let _ = self.handle(event).await;
        self.pump(client, connection).await
    }

    /// Feed every pending event to `client` and send its replies, until the
    /// exchange goes quiet. Returns everything the client saw.
    pub async fn pump(&self, client: &mut RecoveryClient, connection: u64) -> Vec<ServerEvent> {
        let mut seen = Vec::new();
        loop {
            let events = self.drain(connection);
            if events.is_empty() {
                return seen;
            }
            for event in events {
                let replies = client.on_event(&event);
                seen.push(event);
                for reply in replies {
                    self.send(connection, reply).await;
                }
            }
        }
    }
}

pub fn session_id(events: &[ServerEvent]) -> SessionId {
    events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ConnectionState { session_id, .. } => Some(session_id.clone()),
            _ => None,
        })
        .expect("connectionState event")
}

pub fn messages(events: &[ServerEvent]) -> Vec<(u64, String, Value)> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Message(m) => Some((m.sequence, m.topic.clone(), m.payload.clone())),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Error { kind, .. } => Some(kind.clone()),
            _ => None,
        })
        .collect()
}

pub fn count<F: Fn(&ServerEvent) -> bool>(events: &[ServerEvent], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}
