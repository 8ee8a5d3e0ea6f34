use crate::messaging::{ChunkError, SubscriptionError};
use crate::session::{SessionError, TransportError};
use thiserror::Error;

/// Every failure a session can be told about through an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("invalid subscription: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rate limited: more than {cap} messages per window, queued for {penalty_ms}ms")]
    RateLimited { cap: u32, penalty_ms: u64 },
    #[error("message on topic {topic} evicted from a full outbound queue")]
    MessageEvicted { topic: String },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
}

impl RecoveryError {
    /// Stable name carried in the `kind` field of error events.
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryError::Subscription(_) => "InvalidSubscription",
            RecoveryError::Chunk(err) => match err {
                ChunkError::InvalidIndex { .. } => "InvalidIndex",
                ChunkError::InconsistentTotal { .. } => "InconsistentTotal",
                ChunkError::UnknownTransfer { .. } => "UnknownTransfer",
                ChunkError::TransferLimit { .. } => "TransferLimit",
                ChunkError::TimedOut { .. } => "TransferTimeout",
                ChunkError::Incomplete { .. } => "TransferIncomplete",
                ChunkError::ReconstructionFailed { .. } => "ReconstructionFailed",
            },
            RecoveryError::Session(err) => match err {
                SessionError::InvalidTransition { .. } => "InvalidTransition",
                SessionError::DuplicateSession { .. } => "DuplicateSession",
                SessionError::Expired { .. } => "SessionExpired",
            },
            RecoveryError::Transport(_) => "Transport",
            RecoveryError::RateLimited { .. } => "RateLimited",
            RecoveryError::MessageEvicted { .. } => "MessageEvicted",
            RecoveryError::Malformed(_) => "MalformedMessage",
            RecoveryError::UnknownSession(_) => "UnknownSession",
        }
    }

    /// Fatal errors end the session; everything else is reported and the
    /// session carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecoveryError::Session(SessionError::Expired { .. }))
    }
}
