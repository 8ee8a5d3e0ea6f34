//! Per-session message handling.
//!
//! - `chunks` - Chunked transfer reassembly and missing-chunk queries
//! - `subscriptions` - Topic membership and disconnected backlog
//! - `throttle` - Outbound rate gate with a priority queue
//! - `topics` - Topic naming policy

pub mod chunks;
pub mod subscriptions;
pub mod throttle;
pub mod topics;

pub use chunks::*;
pub use subscriptions::*;
pub use throttle::*;
pub use topics::*;
