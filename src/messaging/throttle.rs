//! Per-session outbound rate gate with a priority backlog.
//!
//! A fixed window counts every arrival while the gate is open. The first
//! arrival past the cap closes the gate for the penalty duration and produces
//! a single [`ThrottleNotice`]. While the gate is closed, or while anything is
//! still queued, arrivals are queued by priority (higher first, ties by
//! arrival). The queue drains one batch per drain interval regardless of gate
//! state, so a sustained burst delays low-priority messages but never starves
//! them.

use crate::config::ThrottleConfig;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const DEFAULT_PRIORITY: i32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
    pub priority: i32,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Value, priority: Option<i32>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
        }
    }
}

/// Raised once each time the gate closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleNotice {
    pub reason: String,
    pub cap: u32,
    pub penalty: Duration,
}

/// What happened to an offered message.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Gate open and nothing queued ahead: deliver now.
    Send(OutboundMessage),
    /// Held for the drain loop. `evicted` is a lower-priority entry pushed out
    /// to make room.
    Queued {
        notice: Option<ThrottleNotice>,
        evicted: Option<OutboundMessage>,
    },
    /// Queue full of entries at equal or higher priority; the offered message
    /// itself is the one evicted.
    Evicted {
        message: OutboundMessage,
        notice: Option<ThrottleNotice>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub received: u64,
    pub sent_immediately: u64,
    pub drained: u64,
    pub evicted: u64,
    pub notifications: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    arrival: u64,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: OutboundMessage,
    enqueued_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ThrottleQueue {
    config: ThrottleConfig,
    window_start: Option<Instant>,
    count_in_window: u32,
    throttled_until: Option<Instant>,
    queue: BTreeMap<QueueKey, QueuedMessage>,
    next_arrival: u64,
    next_drain_at: Option<Instant>,
    frozen: bool,
    stats: ThrottleStats,
}

impl ThrottleQueue {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            window_start: None,
            count_in_window: 0,
            throttled_until: None,
            queue: BTreeMap::new(),
            next_arrival: 0,
            next_drain_at: None,
            frozen: false,
            stats: ThrottleStats::default(),
        }
    }

    pub fn offer(&mut self, message: OutboundMessage, now: Instant) -> Admission {
        self.stats.received += 1;
        self.refresh_gate(now);

        let mut notice = None;
        if !self.frozen && self.throttled_until.is_none() {
            // Queued arrivals count against the window too.
            self.count_in_window += 1;
            if self.count_in_window <= self.config.max_messages_per_window {
                if self.queue.is_empty() {
                    self.stats.sent_immediately += 1;
                    return Admission::Send(message);
                }
                return self.enqueue(message, now, None);
            }
            self.throttled_until = Some(now + self.config.penalty());
            self.stats.notifications += 1;
            notice = Some(ThrottleNotice {
                reason: "message rate exceeded".to_string(),
                cap: self.config.max_messages_per_window,
                penalty: self.config.penalty(),
            });
            tracing::debug!(
                cap = self.config.max_messages_per_window,
                penalty_ms = self.config.penalty_ms,
                "throttle gate closed"
            );
        }
        self.enqueue(message, now, notice)
    }

    fn enqueue(
        &mut self,
        message: OutboundMessage,
        now: Instant,
        notice: Option<ThrottleNotice>,
    ) -> Admission {
        let mut evicted = None;
        if self.queue.len() >= self.config.max_queue_depth {
            let lowest = self.queue.keys().next_back().copied();
            match lowest {
                Some(key) if key.priority.0 < message.priority => {
                    evicted = self.queue.remove(&key).map(|q| q.message);
                }
                _ => {
                    self.stats.evicted += 1;
                    return Admission::Evicted { message, notice };
                }
            }
            self.stats.evicted += 1;
        }
        self.next_arrival += 1;
        let key = QueueKey {
            priority: Reverse(message.priority),
            arrival: self.next_arrival,
        };
        self.queue.insert(
            key,
            QueuedMessage {
                message,
                enqueued_at: now,
            },
        );
        if self.next_drain_at.is_none() && !self.frozen {
            self.next_drain_at = Some(now + self.config.drain_interval());
        }
        Admission::Queued { notice, evicted }
    }

    /// Release the next batch if the drain cadence is due.
    pub fn drain_due(&mut self, now: Instant) -> Vec<OutboundMessage> {
        self.refresh_gate(now);
        if self.frozen || self.queue.is_empty() {
            if self.queue.is_empty() {
                self.next_drain_at = None;
            }
            return Vec::new();
        }
        let due = self.next_drain_at.get_or_insert(now);
        if now < *due {
            return Vec::new();
        }
        let mut batch = Vec::with_capacity(self.config.drain_batch);
        while batch.len() < self.config.drain_batch {
            match self.queue.pop_first() {
                Some((_, queued)) => batch.push(queued.message),
                None => break,
            }
        }
        self.stats.drained += batch.len() as u64;
        self.next_drain_at = if self.queue.is_empty() {
            None
        } else {
            Some(now + self.config.drain_interval())
        };
        batch
    }

    /// Empty the queue in drain order, ignoring the drain cadence.
    pub fn take_queued(&mut self) -> Vec<OutboundMessage> {
        let taken: Vec<_> = std::mem::take(&mut self.queue)
            .into_values()
            .map(|q| q.message)
            .collect();
        self.stats.drained += taken.len() as u64;
        self.next_drain_at = None;
        taken
    }

    /// Stop draining; queued entries are kept.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.next_drain_at = None;
    }

    /// Resume draining from `now`.
    pub fn thaw(&mut self, now: Instant) {
        self.frozen = false;
        if !self.queue.is_empty() {
            self.next_drain_at = Some(now);
        }
    }

    pub fn is_throttled(&self, now: Instant) -> bool {
        self.throttled_until.is_some_and(|until| now < until)
    }

    pub fn throttled_until(&self) -> Option<Instant> {
        self.throttled_until
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> ThrottleStats {
        self.stats
    }

    /// Longest time any queued entry has been waiting.
    pub fn oldest_wait(&self, now: Instant) -> Option<Duration> {
        self.queue
            .values()
            .map(|q| now.saturating_duration_since(q.enqueued_at))
            .max()
    }

    /// Queued messages in drain order.
    pub fn queued(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.queue.values().map(|q| &q.message)
    }

    fn refresh_gate(&mut self, now: Instant) {
        if let Some(until) = self.throttled_until {
            if now >= until {
                self.throttled_until = None;
                self.window_start = Some(now);
                self.count_in_window = 0;
            }
        }
        let expired = self
            .window_start
            .map_or(true, |start| now.duration_since(start) >= self.config.window());
        if expired {
            self.window_start = Some(now);
            self.count_in_window = 0;
        }
    }
}
