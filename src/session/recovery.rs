//! Reacts to transport events and drives each session through recovery.
//!
//! Every handler locks exactly one session, collects the events it produces,
//! and sends them while still holding that lock so a connection only ever
//! has one writer. Publishing fans out after the publisher's lock is
//! released.

use crate::config::Config;
use crate::error::RecoveryError;
use crate::messaging::{
    Admission, ChunkError, JsonDecoder, OutboundMessage, PayloadDecoder, RecordOutcome,
    TopicPolicy,
};
use crate::ops::metrics::{MetricsSnapshot, RecoveryMetrics};
use crate::session::events::{ClientMessage, ServerEvent, SubscriptionStatus, TransportEvent};
use crate::session::manager::{SessionHandle, SessionManager};
use crate::session::retry::{retry_async, RetryPolicy};
use crate::session::state::{
    ConnectionId, ReadyOutcome, Session, SessionError, SessionId, SessionPhase, SessionSnapshot,
};
use crate::session::transport::Transport;
use crate::time::Clock;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

/// A publish request waiting for fan-out once the publisher is unlocked.
struct PendingPublish {
    topic: String,
    payload: Value,
    priority: Option<i32>,
}

pub struct RecoveryCoordinator<C: Clock, T: Transport> {
    config: Config,
    clock: C,
    transport: Arc<T>,
    sessions: Mutex<SessionManager>,
    metrics: Arc<RecoveryMetrics>,
    topics: TopicPolicy,
    retry: RetryPolicy,
}

impl<C: Clock, T: Transport> RecoveryCoordinator<C, T> {
    pub fn new(config: Config, clock: C, transport: Arc<T>) -> Self {
        Self::with_decoder(config, clock, transport, Arc::new(JsonDecoder))
    }

    pub fn with_decoder(
        config: Config,
        clock: C,
        transport: Arc<T>,
        decoder: Arc<dyn PayloadDecoder>,
    ) -> Self {
        let topics = TopicPolicy::from_config(&config.subscriptions);
        let retry = RetryPolicy::from_config(&config.recovery);
        let sessions = Mutex::new(SessionManager::new(config.clone(), decoder));
        Self {
            config,
            clock,
            transport,
            sessions,
            metrics: Arc::new(RecoveryMetrics::new()),
            topics,
            retry,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.lock().get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub async fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let handle = self.sessions.lock().get(id)?;
        let session = handle.lock().await;
        Some(session.snapshot())
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let all = self.sessions.lock().all();
        let mut out = Vec::with_capacity(all.len());
        for (_, handle) in all {
            out.push(handle.lock().await.snapshot());
        }
        out
    }

    /// Apply one transport event. Errors that could be reported to a session
    /// already were; the returned error is for the caller's logs.
    pub async fn handle(&self, event: TransportEvent) -> Result<(), RecoveryError> {
        match event {
            TransportEvent::Connected {
                connection,
                session_token,
                last_acked_sequence,
            } => {
                self.on_connected(connection, session_token, last_acked_sequence)
                    .await
            }
            TransportEvent::Disconnected { connection, reason } => {
                self.on_disconnected(connection, &reason).await
            }
            TransportEvent::Reconnecting { session_token } => {
                self.on_reconnecting(&session_token).await
            }
            TransportEvent::Message {
                connection,
                message,
            } => self.on_message(connection, message).await,
        }
    }

    async fn on_connected(
        &self,
        connection: ConnectionId,
        token: Option<String>,
        last_acked: Option<u64>,
    ) -> Result<(), RecoveryError> {
        let now = self.clock.now();
        let resumable = token
            .as_deref()
            .and_then(SessionId::parse)
            .and_then(|id| {
                let handle = self.sessions.lock().get(&id)?;
                Some((id, handle))
            });
        let Some((id, handle)) = resumable else {
            return self.start_fresh(connection).await;
        };

        let mut session = handle.lock().await;
        if let Some(stale) = session.superseded_by(connection) {
            // The new connection beat the old one's disconnect event.
            session.on_disconnect(now)?;
            self.sessions.lock().unbind(stale);
            self.metrics.connections_superseded.inc();
            tracing::info!(session = %id, %stale, %connection, "connection superseded");
        }
        let resumed = session.on_resume(connection, now);
        match resumed {
            Ok(()) => {
                self.sessions.lock().bind(connection, id.clone());
                self.metrics.sessions_resumed.inc();
                tracing::info!(session = %id, %connection, "session resuming");
                let mut out = Vec::new();
                self.begin_recovery(&mut session, now, &mut out);
                if let Some(last_acked) = last_acked {
                    self.reconcile(&mut session, last_acked, &mut out);
                }
                self.try_complete(&mut session, now, &mut out);
                self.flush(&session, out).await;
                Ok(())
            }
            Err(err @ SessionError::DuplicateSession { .. }) => {
                drop(session);
                self.metrics.duplicate_resumes.inc();
                tracing::warn!(session = %id, %connection, "rejected duplicate resume");
                let err = RecoveryError::from(err);
                self.send_best_effort(connection, ServerEvent::error(&err))
                    .await;
                Err(err)
            }
            Err(SessionError::Expired { .. }) => {
                drop(session);
                self.discard(&id);
                self.metrics.sessions_expired.inc();
                tracing::info!(session = %id, "expired session presented, starting fresh");
                self.start_fresh(connection).await
            }
            Err(err) => {
                drop(session);
                let err = RecoveryError::from(err);
                self.send_best_effort(connection, ServerEvent::error(&err))
                    .await;
                Err(err)
            }
        }
    }

    async fn start_fresh(&self, connection: ConnectionId) -> Result<(), RecoveryError> {
        let (id, handle) = self.sessions.lock().create(connection);
        self.metrics.sessions_created.inc();
        tracing::info!(session = %id, %connection, "session created");
        let session = handle.lock().await;
        let event = ServerEvent::ConnectionState {
            session_id: id,
            is_reconnection: false,
            reconnection_count: session.reconnect_count(),
            subscriptions: session.subscriptions.topics(),
        };
        self.flush(&session, vec![event]).await;
        Ok(())
    }

    async fn on_disconnected(
        &self,
        connection: ConnectionId,
        reason: &str,
    ) -> Result<(), RecoveryError> {
        let bound = {
            let mut sessions = self.sessions.lock();
            let id = sessions.unbind(connection);
            id.and_then(|id| Some((id.clone(), sessions.get(&id)?)))
        };
        let Some((id, handle)) = bound else {
            return Ok(());
        };
        let mut session = handle.lock().await;
        if session.connection() != Some(connection) {
            return Ok(());
        }
        session.on_disconnect(self.clock.now())?;
        tracing::info!(session = %id, %connection, reason, "session disconnected");
        Ok(())
    }

    async fn on_reconnecting(&self, token: &str) -> Result<(), RecoveryError> {
        let handle = SessionId::parse(token).and_then(|id| self.sessions.lock().get(&id));
        let Some(handle) = handle else {
            return Err(RecoveryError::UnknownSession(token.to_string()));
        };
        let mut session = handle.lock().await;
        session.on_reconnecting()?;
        tracing::debug!(session = %session.id(), "transport reconnecting");
        Ok(())
    }

    async fn on_message(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), RecoveryError> {
        let bound = self.sessions.lock().by_connection(connection);
        let handle = match bound {
            Some((_, handle)) => handle,
            None => {
                let err = RecoveryError::UnknownSession(connection.to_string());
                self.send_best_effort(connection, ServerEvent::error(&err))
                    .await;
                return Err(err);
            }
        };
        let mut session = handle.lock().await;
        if session.connection() != Some(connection) {
            return Err(RecoveryError::UnknownSession(connection.to_string()));
        }

        let now = self.clock.now();
        let mut out = Vec::new();
        let publish = match self.apply(&mut session, message, now, &mut out) {
            Ok(publish) => publish,
            Err(err) => {
                self.metrics.validation_errors.inc();
                tracing::debug!(session = %session.id(), kind = err.kind(), error = %err, "rejected client message");
                out.push(ServerEvent::error(&err));
                None
            }
        };
        self.try_complete(&mut session, now, &mut out);
        self.flush(&session, out).await;
        drop(session);

        if let Some(publish) = publish {
            self.publish(publish.topic, publish.payload, publish.priority)
                .await;
        }
        Ok(())
    }

    fn apply(
        &self,
        session: &mut Session,
        message: ClientMessage,
        now: Instant,
        out: &mut Vec<ServerEvent>,
    ) -> Result<Option<PendingPublish>, RecoveryError> {
        match message {
            ClientMessage::Subscribe { topics } => {
                let topics = session.subscriptions.subscribe(&topics)?;
                if let Some(progress) = session.recovery_mut() {
                    progress.subscriptions_replayed = true;
                }
                out.push(ServerEvent::SubscriptionUpdated {
                    status: SubscriptionStatus::Subscribed,
                    topics,
                });
            }
            ClientMessage::Unsubscribe { topics } => {
                let topics = session.subscriptions.unsubscribe(&topics)?;
                out.push(ServerEvent::SubscriptionUpdated {
                    status: SubscriptionStatus::Unsubscribed,
                    topics,
                });
            }
            ClientMessage::Publish {
                topic,
                payload,
                priority,
            } => {
                self.topics.validate_topic(&topic)?;
                return Ok(Some(PendingPublish {
                    topic,
                    payload,
                    priority,
                }));
            }
            ClientMessage::Ack { sequence } => {
                session.record_ack(sequence);
            }
            ClientMessage::RecoveryRequest {
                last_acked_sequence,
            } => {
                self.reconcile(session, last_acked_sequence, out);
            }
            ClientMessage::Chunk {
                message_id,
                chunk_index,
                total_chunks,
                data,
            } => {
                self.metrics.chunks_received.inc();
                let receipt =
                    session
                        .chunks
                        .receive_chunk(&message_id, chunk_index, total_chunks, data, now)?;
                out.push(ServerEvent::ChunkAck(receipt.ack));
                match receipt.reconstruction {
                    Some(Ok(reassembled)) => {
                        self.metrics.transfers_reconstructed.inc();
                        out.push(ServerEvent::MessageReconstructed {
                            message_id: reassembled.message_id,
                            message: reassembled.message,
                        });
                    }
                    Some(Err(err)) => {
                        self.metrics.reconstruction_failures.inc();
                        out.push(ServerEvent::error(&RecoveryError::from(err)));
                    }
                    None => {}
                }
            }
            ClientMessage::ChunkStatusQuery { message_id } => {
                let status = session.chunks.query_status(&message_id)?;
                out.push(ServerEvent::ChunkStatus(status));
            }
            ClientMessage::AbandonTransfer { message_id } => {
                let transfer = session.chunks.abandon(&message_id)?;
                tracing::info!(
                    session = %session.id(),
                    message_id,
                    received = transfer.received_count(),
                    total = transfer.total_chunks(),
                    "transfer abandoned by client"
                );
            }
        }
        Ok(None)
    }

    /// Route a message to every session subscribed to `topic`. Connected
    /// sessions pass it through their throttle; everyone else backlogs it.
    /// Returns the number of sessions it reached.
    pub async fn publish(&self, topic: String, payload: Value, priority: Option<i32>) -> usize {
        let now = self.clock.now();
        let all = self.sessions.lock().all();
        let mut reached = 0;
        for (_, handle) in all {
            let mut session = handle.lock().await;
            if !session.subscriptions.is_subscribed(&topic) {
                continue;
            }
            let mut out = Vec::new();
            let message = OutboundMessage::new(topic.clone(), payload.clone(), priority);
            if self.deliver(&mut session, message, now, &mut out) {
                reached += 1;
            }
            self.flush(&session, out).await;
        }
        reached
    }

    fn deliver(
        &self,
        session: &mut Session,
        message: OutboundMessage,
        now: Instant,
        out: &mut Vec<ServerEvent>,
    ) -> bool {
        match session.phase() {
            SessionPhase::Connected => {
                self.offer(session, message, now, out);
                true
            }
            SessionPhase::Expired => false,
            _ => {
                let outcome = session
                    .subscriptions
                    .record_while_disconnected(&message.topic, message.payload);
                if let RecordOutcome::RecordedWithDrop(dropped) = outcome {
                    self.metrics.backlog_dropped.inc();
                    tracing::warn!(
                        session = %session.id(),
                        topic = %dropped.topic,
                        "backlog full, dropped oldest entry"
                    );
                }
                true
            }
        }
    }

    fn offer(
        &self,
        session: &mut Session,
        message: OutboundMessage,
        now: Instant,
        out: &mut Vec<ServerEvent>,
    ) {
        let (notice, evicted) = match session.throttle.offer(message, now) {
            Admission::Send(message) => {
                self.send_sequenced(session, message, out);
                return;
            }
            Admission::Queued { notice, evicted } => {
                self.metrics.messages_queued.inc();
                (notice, evicted)
            }
            Admission::Evicted { message, notice } => (notice, Some(message)),
        };
        if let Some(notice) = notice {
            self.metrics.throttle_notifications.inc();
            let limited = RecoveryError::RateLimited {
                cap: notice.cap,
                penalty_ms: notice.penalty.as_millis() as u64,
            };
            tracing::info!(session = %session.id(), kind = limited.kind(), "{limited}");
            out.push(ServerEvent::throttled(&notice));
        }
        if let Some(evicted) = evicted {
            self.metrics.messages_evicted.inc();
            let err = RecoveryError::MessageEvicted {
                topic: evicted.topic,
            };
            tracing::warn!(session = %session.id(), "{err}");
            out.push(ServerEvent::error(&err));
        }
    }

    fn send_sequenced(
        &self,
        session: &mut Session,
        message: OutboundMessage,
        out: &mut Vec<ServerEvent>,
    ) {
        let sequenced = session.sequence(message.topic, message.payload);
        self.metrics.messages_sent.inc();
        out.push(ServerEvent::Message(sequenced));
    }

    fn begin_recovery(&self, session: &mut Session, now: Instant, out: &mut Vec<ServerEvent>) {
        let session_id = session.id().clone();
        let server_sequence = session.server_sequence();
        for status in session.chunks.incomplete() {
            out.push(ServerEvent::ChunkStatus(status));
        }
        let Some(progress) = session.recovery_mut() else {
            return;
        };
        progress.transfers_offered = true;
        progress.prompt_attempts = 1;
        progress.next_prompt_at = Some(now + progress.backoff.next_delay());
        self.metrics.recovery_prompts.inc();
        out.insert(
            0,
            ServerEvent::RecoveryPrompt {
                session_id,
                prior_subscriptions: progress.prior_topics.clone(),
                server_sequence,
                attempt: 1,
            },
        );
    }

    fn reconcile(&self, session: &mut Session, last_acked: u64, out: &mut Vec<ServerEvent>) {
        if let Some(payload) = session.reconcile(last_acked) {
            if payload.truncated {
                tracing::warn!(
                    session = %session.id(),
                    last_acked,
                    server_sequence = payload.server_sequence,
                    "replay journal no longer reaches client ack"
                );
            }
            self.metrics
                .messages_replayed
                .add(payload.pending.len() as u64);
            out.push(ServerEvent::recovery_data(payload));
        }
    }

    /// `Recovering → Connected` once the handshake is done: release messages
    /// still held by the throttle, then the backlog, behind the
    /// connection-state event.
    fn try_complete(&self, session: &mut Session, now: Instant, out: &mut Vec<ServerEvent>) {
        let done = session
            .recovery()
            .is_some_and(|progress| progress.handshake_done());
        if session.phase() != SessionPhase::Recovering || !done {
            return;
        }
        let backlog = session.drain_backlog();
        let outcome = match session.complete_recovery(now) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(session = %session.id(), error = %err, "recovery did not complete");
                return;
            }
        };
        self.metrics.recoveries_completed.inc();
        tracing::info!(
            session = %session.id(),
            reconnects = outcome.reconnect_count,
            backlog = backlog.len(),
            "session recovered"
        );
        out.push(ServerEvent::ConnectionState {
            session_id: outcome.session_id,
            is_reconnection: true,
            reconnection_count: outcome.reconnect_count,
            subscriptions: outcome.subscriptions,
        });
        // Held before the disconnect, so ahead of anything published since.
        for message in session.throttle.take_queued() {
            self.send_sequenced(session, message, out);
        }
        self.metrics.backlog_delivered.add(backlog.len() as u64);
        for entry in backlog {
            let message = OutboundMessage::new(entry.topic, entry.payload, None);
            self.send_sequenced(session, message, out);
        }
    }

    /// The client never finished the handshake: keep its prior topics, answer
    /// from the server's own ack record, and complete.
    fn fall_back(&self, session: &mut Session, now: Instant, out: &mut Vec<ServerEvent>) {
        let Some(progress) = session.recovery_mut() else {
            return;
        };
        let restore = !progress.subscriptions_replayed;
        let reconcile = !progress.sequence_reconciled;
        progress.subscriptions_replayed = true;
        progress.transfers_offered = true;
        self.metrics.recovery_fallbacks.inc();
        tracing::warn!(session = %session.id(), "recovery prompts exhausted, restoring prior state");
        if restore {
            out.push(ServerEvent::SubscriptionUpdated {
                status: SubscriptionStatus::Restored,
                topics: session.subscriptions.topics(),
            });
        }
        if reconcile {
            let last_acked = session.last_acked_sequence();
            self.reconcile(session, last_acked, out);
        }
        self.try_complete(session, now, out);
    }

    /// Expiry sweep, throttle drains, transfer timeouts and recovery prompts.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let all = self.sessions.lock().all();
        let mut expired = Vec::new();
        for (id, handle) in all {
            let mut session = handle.lock().await;
            if session.expire_if_due(now) || session.phase() == SessionPhase::Expired {
                expired.push(id);
                continue;
            }
            let mut out = Vec::new();
            match session.phase() {
                SessionPhase::Connected => {
                    for message in session.throttle.drain_due(now) {
                        self.send_sequenced(&mut session, message, &mut out);
                    }
                    let idle_ms = self.config.chunks.transfer_timeout_ms;
                    for message_id in session.chunks.expire_idle(now) {
                        self.metrics.transfers_timed_out.inc();
                        let err = ChunkError::TimedOut {
                            message_id,
                            idle_ms,
                        };
                        out.push(ServerEvent::error(&RecoveryError::from(err)));
                    }
                }
                SessionPhase::Recovering => self.prompt_if_due(&mut session, now, &mut out),
                _ => {}
            }
            self.flush(&session, out).await;
        }
        for id in expired {
            self.discard(&id);
            self.metrics.sessions_expired.inc();
            tracing::info!(session = %id, "session expired");
        }
    }

    fn prompt_if_due(&self, session: &mut Session, now: Instant, out: &mut Vec<ServerEvent>) {
        let max_attempts = self.config.recovery.prompt_max_attempts;
        let session_id = session.id().clone();
        let server_sequence = session.server_sequence();
        let Some(progress) = session.recovery_mut() else {
            return;
        };
        if progress.next_prompt_at.map_or(true, |at| now < at) {
            return;
        }
        if progress.prompt_attempts >= max_attempts {
            self.fall_back(session, now, out);
            return;
        }
        progress.prompt_attempts += 1;
        progress.next_prompt_at = Some(now + progress.backoff.next_delay());
        self.metrics.recovery_prompts.inc();
        out.push(ServerEvent::RecoveryPrompt {
            session_id,
            prior_subscriptions: progress.prior_topics.clone(),
            server_sequence,
            attempt: progress.prompt_attempts,
        });
    }

    /// Resolves when the session is next `Connected`, or fails with
    /// `SessionExpired` if it expires first.
    pub async fn wait_until_ready(&self, id: &SessionId) -> Result<ReadyOutcome, RecoveryError> {
        let handle = self.sessions.lock().get(id);
        let Some(handle) = handle else {
            return Err(RecoveryError::UnknownSession(id.to_string()));
        };
        let rx = {
            let mut session = handle.lock().await;
            let (tx, rx) = oneshot::channel();
            session.register_waiter(tx);
            rx
        };
        match rx.await {
            Ok(result) => result.map_err(RecoveryError::from),
            Err(_) => Err(SessionError::Expired {
                session_id: id.clone(),
            }
            .into()),
        }
    }

    /// Drive the coordinator from a channel of transport events until the
    /// channel closes or shutdown is signalled.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.tick_period();
        let sleep = self.clock.sleep(period);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("recovery coordinator shutting down");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle(event).await {
                            tracing::debug!(kind = err.kind(), error = %err, "transport event rejected");
                        }
                    }
                    None => break,
                },
                _ = &mut sleep => {
                    self.tick().await;
                    sleep.as_mut().reset(tokio::time::Instant::now() + period);
                }
            }
        }
    }

    fn tick_period(&self) -> Duration {
        self.config
            .throttle
            .drain_interval()
            .min(Duration::from_millis(
                self.config.recovery.prompt_initial_delay_ms,
            ))
            .max(Duration::from_millis(1))
    }

    fn discard(&self, id: &SessionId) {
        self.sessions.lock().remove(id);
    }

    async fn flush(&self, session: &Session, events: Vec<ServerEvent>) {
        let Some(connection) = session.connection() else {
            return;
        };
        for event in events {
            let name = event.name();
            let result = if is_critical(&event) {
                let transport = self.transport.clone();
                retry_async(&self.clock, self.retry, |_| {
                    let transport = transport.clone();
                    let event = event.clone();
                    async move { transport.send(connection, event).await }
                })
                .await
            } else {
                self.transport.send(connection, event).await
            };
            if let Err(err) = result {
                self.metrics.send_failures.inc();
                tracing::warn!(session = %session.id(), %connection, event = name, error = %err, "send failed");
                break;
            }
        }
    }

    async fn send_best_effort(&self, connection: ConnectionId, event: ServerEvent) {
        if let Err(err) = self.transport.send(connection, event).await {
            self.metrics.send_failures.inc();
            tracing::debug!(%connection, error = %err, "send failed");
        }
    }
}

fn is_critical(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::RecoveryData { .. }
            | ServerEvent::ConnectionState { .. }
            | ServerEvent::RecoveryPrompt { .. }
    )
}

impl<C: Clock, T: Transport> std::fmt::Debug for RecoveryCoordinator<C, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("sessions", &self.session_count())
            .finish()
    }
}
