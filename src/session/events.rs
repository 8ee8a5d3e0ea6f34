//! Wire events exchanged with clients and the transport adapter.
//!
//! Every event is a JSON object tagged by `event`; field names are camelCase.

use crate::error::RecoveryError;
use crate::messaging::{ChunkAck, ChunkStatus, ThrottleNotice};
use crate::session::state::{ConnectionId, ReplayPayload, SequencedMessage, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests a client sends over an established connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// `topics` stays untyped so malformed lists are reported as
    /// `InvalidSubscription` instead of failing to parse.
    Subscribe {
        topics: Value,
    },
    Unsubscribe {
        topics: Value,
    },
    Publish {
        topic: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i32>,
    },
    Ack {
        sequence: u64,
    },
    RecoveryRequest {
        last_acked_sequence: u64,
    },
    Chunk {
        message_id: String,
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ChunkStatusQuery {
        message_id: String,
    },
    AbandonTransfer {
        message_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
    /// Prior topics reinstated by the server after the client never
    /// resubscribed during recovery.
    Restored,
}

/// Events the core sends to a session's connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    SubscriptionUpdated {
        status: SubscriptionStatus,
        topics: Vec<String>,
    },
    Error {
        kind: String,
        details: String,
    },
    ChunkAck(ChunkAck),
    ChunkStatus(ChunkStatus),
    MessageReconstructed {
        message_id: String,
        message: Value,
    },
    ThrottlingNotification {
        reason: String,
        cap: u32,
        /// Milliseconds.
        penalty_duration: u64,
    },
    RecoveryData {
        pending_messages: Vec<SequencedMessage>,
        server_sequence: u64,
        truncated: bool,
    },
    ConnectionState {
        session_id: SessionId,
        is_reconnection: bool,
        reconnection_count: u64,
        subscriptions: Vec<String>,
    },
    /// Sent on resume, and re-sent with backoff, until the client has both
    /// resubscribed and asked for recovery data.
    RecoveryPrompt {
        session_id: SessionId,
        prior_subscriptions: Vec<String>,
        server_sequence: u64,
        attempt: u32,
    },
    Message(SequencedMessage),
}

impl ServerEvent {
    pub fn error(err: &RecoveryError) -> Self {
        ServerEvent::Error {
            kind: err.kind().to_string(),
            details: err.to_string(),
        }
    }

    pub fn throttled(notice: &ThrottleNotice) -> Self {
        ServerEvent::ThrottlingNotification {
            reason: notice.reason.clone(),
            cap: notice.cap,
            penalty_duration: notice.penalty.as_millis() as u64,
        }
    }

    pub fn recovery_data(payload: ReplayPayload) -> Self {
        ServerEvent::RecoveryData {
            pending_messages: payload.pending,
            server_sequence: payload.server_sequence,
            truncated: payload.truncated,
        }
    }

    /// Wire name of the event, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SubscriptionUpdated { .. } => "subscriptionUpdated",
            ServerEvent::Error { .. } => "error",
            ServerEvent::ChunkAck(_) => "chunkAck",
            ServerEvent::ChunkStatus(_) => "chunkStatus",
            ServerEvent::MessageReconstructed { .. } => "messageReconstructed",
            ServerEvent::ThrottlingNotification { .. } => "throttlingNotification",
            ServerEvent::RecoveryData { .. } => "recoveryData",
            ServerEvent::ConnectionState { .. } => "connectionState",
            ServerEvent::RecoveryPrompt { .. } => "recoveryPrompt",
            ServerEvent::Message(_) => "message",
        }
    }
}

/// Raw lifecycle and message events raised by the transport adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransportEvent {
    /// New connection. A token naming a live session resumes it; the client
    /// may also piggyback its last acked sequence as the recovery request.
    Connected {
        connection: ConnectionId,
        #[serde(default)]
        session_token: Option<String>,
        #[serde(default)]
        last_acked_sequence: Option<u64>,
    },
    Disconnected {
        connection: ConnectionId,
        #[serde(default)]
        reason: String,
    },
    Reconnecting {
        session_token: String,
    },
    Message {
        connection: ConnectionId,
        message: ClientMessage,
    },
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}
