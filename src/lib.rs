#![warn(unused, dead_code)]
#![warn(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
// Documentation style
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::wildcard_imports)]
#![allow(clippy::struct_excessive_bools)]
// Numeric casts: counters and wire fields
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_possible_wrap)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_self)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::large_futures)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::result_large_err)]
#![allow(clippy::unused_async)]

//! Tether - session recovery for real-time publish/subscribe channels.
//!
//! A connection drops; the session outlives it for a grace period. When the
//! client comes back with its token, the server prompts it through a
//! recovery handshake: resubscribe, reconcile sequence numbers, finish any
//! half-delivered chunked transfers, then receive whatever was published
//! while it was away.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Clock abstraction with a manual test clock
//!
//! ## Messaging
//! - `messaging::chunks` - Chunked transfer reassembly
//! - `messaging::subscriptions` - Topic membership and offline backlog
//! - `messaging::throttle` - Outbound rate gate
//! - `messaging::topics` - Topic naming policy
//!
//! ## Session
//! - `session::state` - Lifecycle state machine and replay journal
//! - `session::recovery` - Recovery coordinator
//! - `session::client` - Client side of the handshake
//! - `session::transport` - Transport adapter seam
//!
//! ## Operations
//! - `ops::metrics` - Recovery counters
//! - `ops::telemetry` - Logging bootstrap

// Core infrastructure
pub mod core;

// Errors surfaced to sessions
pub mod error;

// Messaging
pub mod messaging;

// Session lifecycle and recovery
pub mod session;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, time};
pub use error::RecoveryError;
pub use messaging::{chunks, subscriptions, throttle, topics};
pub use ops::{metrics, telemetry};
pub use session::{RecoveryClient, RecoveryCoordinator};
