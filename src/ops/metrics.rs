use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe metric updates.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    pub sessions_created: Counter,
    pub sessions_resumed: Counter,
    pub sessions_expired: Counter,
    pub duplicate_resumes: Counter,
    pub connections_superseded: Counter,
    pub recoveries_completed: Counter,
    pub recovery_fallbacks: Counter,
    pub recovery_prompts: Counter,
    pub messages_replayed: Counter,
    pub backlog_delivered: Counter,
    pub backlog_dropped: Counter,
    pub messages_sent: Counter,
    pub messages_queued: Counter,
    pub messages_evicted: Counter,
    pub throttle_notifications: Counter,
    pub chunks_received: Counter,
    pub transfers_reconstructed: Counter,
    pub reconstruction_failures: Counter,
    pub transfers_timed_out: Counter,
    pub validation_errors: Counter,
    pub send_failures: Counter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_resumed: u64,
    pub sessions_expired: u64,
    pub duplicate_resumes: u64,
    pub connections_superseded: u64,
    pub recoveries_completed: u64,
    pub recovery_fallbacks: u64,
    pub recovery_prompts: u64,
    pub messages_replayed: u64,
    pub backlog_delivered: u64,
    pub backlog_dropped: u64,
    pub messages_sent: u64,
    pub messages_queued: u64,
    pub messages_evicted: u64,
    pub throttle_notifications: u64,
    pub chunks_received: u64,
    pub transfers_reconstructed: u64,
    pub reconstruction_failures: u64,
    pub transfers_timed_out: u64,
    pub validation_errors: u64,
    pub send_failures: u64,
}

impl RecoveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.get(),
            sessions_resumed: self.sessions_resumed.get(),
            sessions_expired: self.sessions_expired.get(),
            duplicate_resumes: self.duplicate_resumes.get(),
            connections_superseded: self.connections_superseded.get(),
            recoveries_completed: self.recoveries_completed.get(),
            recovery_fallbacks: self.recovery_fallbacks.get(),
            recovery_prompts: self.recovery_prompts.get(),
            messages_replayed: self.messages_replayed.get(),
            backlog_delivered: self.backlog_delivered.get(),
            backlog_dropped: self.backlog_dropped.get(),
            messages_sent: self.messages_sent.get(),
            messages_queued: self.messages_queued.get(),
            messages_evicted: self.messages_evicted.get(),
            throttle_notifications: self.throttle_notifications.get(),
            chunks_received: self.chunks_received.get(),
            transfers_reconstructed: self.transfers_reconstructed.get(),
            reconstruction_failures: self.reconstruction_failures.get(),
            transfers_timed_out: self.transfers_timed_out.get(),
            validation_errors: self.validation_errors.get(),
            send_failures: self.send_failures.get(),
        }
    }
}
