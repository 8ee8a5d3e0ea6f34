//! Connection lifecycle of a logical session.
//!
//! A session outlives the transport connections that carry it. Each
//! disconnect starts a grace timer; a resume within the grace period moves the
//! session to `Recovering`, and only [`Session::complete_recovery`] makes it
//! usable again. The session exclusively owns its chunk store, throttle queue
//! and subscription registry, plus a bounded journal of sequenced messages
//! used to answer recovery requests.

use crate::config::Config;
use crate::messaging::{
    BacklogEntry, ChunkStore, PayloadDecoder, SubscriptionRegistry, ThrottleQueue,
};
use crate::session::retry::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

const MAX_TOKEN_LEN: usize = 64;

/// Stable session identity carried across reconnects as the session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept a client-supplied token if it is a plausible session id.
    pub fn parse(token: &str) -> Option<Self> {
        let valid = !token.is_empty()
            && token.len() <= MAX_TOKEN_LEN
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable per-session seed for backoff jitter.
    pub fn jitter_seed(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Ephemeral transport connection; changes on every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Connected,
    Disconnected,
    Reconnecting,
    Recovering,
    Expired,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Connected => "connected",
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Reconnecting => "reconnecting",
            SessionPhase::Recovering => "recovering",
            SessionPhase::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot apply {event} while session is {from}")]
    InvalidTransition {
        from: SessionPhase,
        event: &'static str,
    },
    #[error("session {session_id} is already being resumed")]
    DuplicateSession { session_id: SessionId },
    #[error("session {session_id} expired")]
    Expired { session_id: SessionId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence: u64,
    pub topic: String,
    pub payload: Value,
}

/// Messages the client missed, answered from the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPayload {
    pub pending: Vec<SequencedMessage>,
    pub server_sequence: u64,
    /// The journal no longer reaches back to the client's last ack.
    pub truncated: bool,
}

/// Handshake steps still outstanding for a `Recovering` session.
#[derive(Debug, Clone)]
pub struct RecoveryProgress {
    pub started_at: Instant,
    pub prior_topics: Vec<String>,
    pub subscriptions_replayed: bool,
    pub sequence_reconciled: bool,
    pub backlog_drained: bool,
    pub transfers_offered: bool,
    pub prompt_attempts: u32,
    pub next_prompt_at: Option<Instant>,
    pub backoff: Backoff,
}

impl RecoveryProgress {
    fn new(now: Instant, prior_topics: Vec<String>, backoff: Backoff) -> Self {
        Self {
            started_at: now,
            prior_topics,
            subscriptions_replayed: false,
            sequence_reconciled: false,
            backlog_drained: false,
            transfers_offered: false,
            prompt_attempts: 0,
            next_prompt_at: None,
            backoff,
        }
    }

    /// Client-driven steps are done; the backlog can be drained.
    pub fn handshake_done(&self) -> bool {
        self.subscriptions_replayed && self.sequence_reconciled && self.transfers_offered
    }

    pub fn is_complete(&self) -> bool {
        self.handshake_done() && self.backlog_drained
    }
}

/// Delivered to recovery waiters when the session becomes usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyOutcome {
    pub session_id: SessionId,
    pub reconnect_count: u64,
    pub server_sequence: u64,
    pub subscriptions: Vec<String>,
}

pub type ReadySender = oneshot::Sender<Result<ReadyOutcome, SessionError>>;

/// Point-in-time view for inspection and CLI output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub connection: Option<ConnectionId>,
    pub reconnect_count: u64,
    pub last_acked_sequence: u64,
    pub server_sequence: u64,
    pub journal_len: usize,
    pub subscriptions: Vec<String>,
    pub backlog_len: usize,
    pub pending_transfers: usize,
    pub throttle_queue_len: usize,
}

pub struct Session {
    id: SessionId,
    phase: SessionPhase,
    connection: Option<ConnectionId>,
    reconnect_count: u64,
    last_acked_sequence: u64,
    server_sequence: u64,
    journal: VecDeque<SequencedMessage>,
    journal_capacity: usize,
    grace_period: Duration,
    expires_at: Option<Instant>,
    recovery: Option<RecoveryProgress>,
    prompt_backoff: Backoff,
    waiters: Vec<ReadySender>,
    pub chunks: ChunkStore,
    pub throttle: ThrottleQueue,
    pub subscriptions: SubscriptionRegistry,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("connection", &self.connection)
            .field("server_sequence", &self.server_sequence)
            .finish()
    }
}

impl Session {
    /// New session, already `Connected` on `connection`.
    pub fn new(
        id: SessionId,
        connection: ConnectionId,
        config: &Config,
        decoder: Arc<dyn PayloadDecoder>,
    ) -> Self {
        let prompt_backoff = Backoff::from_config(&config.recovery).with_seed(id.jitter_seed());
        Self {
            id,
            phase: SessionPhase::Connected,
            connection: Some(connection),
            reconnect_count: 0,
            last_acked_sequence: 0,
            server_sequence: 0,
            journal: VecDeque::new(),
            journal_capacity: config.session.journal_capacity.max(1),
            grace_period: config.session.grace_period(),
            expires_at: None,
            recovery: None,
            prompt_backoff,
            waiters: Vec::new(),
            chunks: ChunkStore::new(config.chunks.clone(), decoder),
            throttle: ThrottleQueue::new(config.throttle.clone()),
            subscriptions: SubscriptionRegistry::from_config(&config.subscriptions),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count
    }

    pub fn last_acked_sequence(&self) -> u64 {
        self.last_acked_sequence
    }

    pub fn server_sequence(&self) -> u64 {
        self.server_sequence
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn recovery(&self) -> Option<&RecoveryProgress> {
        self.recovery.as_ref()
    }

    pub fn recovery_mut(&mut self) -> Option<&mut RecoveryProgress> {
        self.recovery.as_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.phase == SessionPhase::Connected
    }

    /// The connection a resume on `connection` would replace, if the session
    /// still believes it is connected elsewhere.
    pub fn superseded_by(&self, connection: ConnectionId) -> Option<ConnectionId> {
        match (self.phase, self.connection) {
            (SessionPhase::Connected, Some(current)) if current != connection => Some(current),
            _ => None,
        }
    }

    /// Transport dropped. Messages now accumulate in the subscription backlog
    /// and the throttle stops draining until recovery completes.
    pub fn on_disconnect(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Connected | SessionPhase::Recovering => {
                self.throttle.freeze();
                self.recovery = None;
                self.expires_at = Some(now + self.grace_period);
            }
            SessionPhase::Reconnecting => {
                if self.expires_at.is_none() {
                    self.expires_at = Some(now + self.grace_period);
                }
            }
            SessionPhase::Disconnected => return Ok(()),
            SessionPhase::Expired => return Err(self.expired()),
        }
        self.connection = None;
        self.phase = SessionPhase::Disconnected;
        Ok(())
    }

    /// Transport is attempting to reconnect. The grace timer keeps running.
    pub fn on_reconnecting(&mut self) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Disconnected | SessionPhase::Reconnecting => {
                self.phase = SessionPhase::Reconnecting;
                Ok(())
            }
            SessionPhase::Expired => Err(self.expired()),
            from => Err(SessionError::InvalidTransition {
                from,
                event: "reconnecting",
            }),
        }
    }

    /// A new connection presented this session's token.
    ///
    /// Only one resume can be in flight; a second one while `Recovering` or
    /// `Connected` is rejected as a duplicate.
    pub fn on_resume(&mut self, connection: ConnectionId, now: Instant) -> Result<(), SessionError> {
        if self.expire_if_due(now) {
            return Err(self.expired());
        }
        match self.phase {
            SessionPhase::Disconnected | SessionPhase::Reconnecting => {
                let prior_topics = self.subscriptions.topics();
                let mut backoff = self.prompt_backoff;
                backoff.reset();
                self.recovery = Some(RecoveryProgress::new(now, prior_topics, backoff));
                self.connection = Some(connection);
                self.expires_at = None;
                self.phase = SessionPhase::Recovering;
                Ok(())
            }
            SessionPhase::Recovering | SessionPhase::Connected => {
                Err(SessionError::DuplicateSession {
                    session_id: self.id.clone(),
                })
            }
            SessionPhase::Expired => Err(self.expired()),
        }
    }

    /// Answer a recovery request from the journal and mark the sequence
    /// reconciled. `None` when the client is already current.
    pub fn reconcile(&mut self, client_last_acked: u64) -> Option<ReplayPayload> {
        let client_last_acked = client_last_acked.min(self.server_sequence);
        self.advance_ack(client_last_acked);
        if let Some(progress) = self.recovery.as_mut() {
            progress.sequence_reconciled = true;
        }
        if client_last_acked >= self.server_sequence {
            return None;
        }
        Some(self.replay_since(client_last_acked))
    }

    /// Journal suffix after `since`.
    pub fn replay_since(&self, since: u64) -> ReplayPayload {
        let pending: Vec<_> = self
            .journal
            .iter()
            .filter(|m| m.sequence > since)
            .cloned()
            .collect();
        let oldest = pending.first().map_or(self.server_sequence + 1, |m| m.sequence);
        ReplayPayload {
            truncated: oldest > since + 1,
            pending,
            server_sequence: self.server_sequence,
        }
    }

    /// Take the disconnected backlog for delivery once the handshake is done.
    pub fn drain_backlog(&mut self) -> Vec<BacklogEntry> {
        let drained = self.subscriptions.drain_backlog();
        if let Some(progress) = self.recovery.as_mut() {
            progress.backlog_drained = true;
        }
        drained
    }

    /// `Recovering → Connected`. Waiters are resolved and the throttle and
    /// transfer idle clocks resume from `now`.
    pub fn complete_recovery(&mut self, now: Instant) -> Result<ReadyOutcome, SessionError> {
        let ready = self.phase == SessionPhase::Recovering
            && self.recovery.as_ref().is_some_and(RecoveryProgress::is_complete);
        if !ready {
            return Err(SessionError::InvalidTransition {
                from: self.phase,
                event: "complete_recovery",
            });
        }
        self.phase = SessionPhase::Connected;
        self.recovery = None;
        self.reconnect_count += 1;
        self.throttle.thaw(now);
        self.chunks.touch_all(now);
        let outcome = self.ready_outcome();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(outcome.clone()));
        }
        Ok(outcome)
    }

    /// Expire if the grace period elapsed without a resume.
    pub fn expire_if_due(&mut self, now: Instant) -> bool {
        let waiting = matches!(
            self.phase,
            SessionPhase::Disconnected | SessionPhase::Reconnecting
        );
        if waiting && self.expires_at.is_some_and(|at| now >= at) {
            self.expire();
            return true;
        }
        false
    }

    /// Terminal. Pending recovery waiters fail with `Expired`.
    pub fn expire(&mut self) {
        self.phase = SessionPhase::Expired;
        self.connection = None;
        self.recovery = None;
        self.expires_at = None;
        let err = self.expired();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Resolve immediately when already connected or expired, otherwise hold
    /// the sender until the next terminal transition.
    pub fn register_waiter(&mut self, waiter: ReadySender) {
        match self.phase {
            SessionPhase::Connected => {
                let _ = waiter.send(Ok(self.ready_outcome()));
            }
            SessionPhase::Expired => {
                let _ = waiter.send(Err(self.expired()));
            }
            _ => self.waiters.push(waiter),
        }
    }

    /// Assign the next sequence and journal the message.
    pub fn sequence(&mut self, topic: String, payload: Value) -> SequencedMessage {
        self.server_sequence += 1;
        let message = SequencedMessage {
            sequence: self.server_sequence,
            topic,
            payload,
        };
        self.journal.push_back(message.clone());
        while self.journal.len() > self.journal_capacity {
            self.journal.pop_front();
        }
        message
    }

    /// Client confirmed processing up to `sequence`. Returns whether the ack
    /// moved forward.
    pub fn record_ack(&mut self, sequence: u64) -> bool {
        let sequence = sequence.min(self.server_sequence);
        if sequence <= self.last_acked_sequence {
            return false;
        }
        self.advance_ack(sequence);
        true
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            phase: self.phase,
            connection: self.connection,
            reconnect_count: self.reconnect_count,
            last_acked_sequence: self.last_acked_sequence,
            server_sequence: self.server_sequence,
            journal_len: self.journal.len(),
            subscriptions: self.subscriptions.topics(),
            backlog_len: self.subscriptions.backlog_len(),
            pending_transfers: self.chunks.len(),
            throttle_queue_len: self.throttle.len(),
        }
    }

    fn advance_ack(&mut self, sequence: u64) {
        if sequence > self.last_acked_sequence {
            self.last_acked_sequence = sequence;
        }
        while self
            .journal
            .front()
            .is_some_and(|m| m.sequence <= self.last_acked_sequence)
        {
            self.journal.pop_front();
        }
    }

    fn ready_outcome(&self) -> ReadyOutcome {
        ReadyOutcome {
            session_id: self.id.clone(),
            reconnect_count: self.reconnect_count,
            server_sequence: self.server_sequence,
            subscriptions: self.subscriptions.topics(),
        }
    }

    fn expired(&self) -> SessionError {
        SessionError::Expired {
            session_id: self.id.clone(),
        }
    }
}
