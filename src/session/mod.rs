//! Session lifecycle and the recovery protocol.
//!
//! - `state` - Per-session lifecycle state machine and replay journal
//! - `manager` - Session registry keyed by session and connection id
//! - `recovery` - Coordinator reacting to transport events
//! - `client` - Client side of the recovery handshake
//! - `events` - Wire events
//! - `transport` - Outbound transport adapter
//! - `retry` - Backoff and retry helpers

pub mod client;
pub mod events;
pub mod manager;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod transport;

pub use client::{ClientPhase, RecoveryClient};
pub use events::{ClientMessage, ServerEvent, SubscriptionStatus, TransportEvent};
pub use manager::{SessionHandle, SessionManager};
pub use recovery::RecoveryCoordinator;
pub use retry::{retry_async, Backoff, RetryPolicy};
pub use state::*;
pub use transport::{ChannelTransport, RecordingTransport, SendFuture, Transport, TransportError};
