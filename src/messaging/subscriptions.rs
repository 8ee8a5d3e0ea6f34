use crate::config::SubscriptionConfig;
use crate::messaging::topics::{SubscriptionError, TopicPolicy, ALL_TOPIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Message held for a topic while the session was away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogEntry {
    pub enqueue_index: u64,
    pub topic: String,
    pub payload: Value,
}

/// Result of appending to a topic backlog.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded,
    /// The topic backlog was full; its oldest entry was discarded.
    RecordedWithDrop(BacklogEntry),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BacklogStats {
    pub entries: usize,
    pub topics: usize,
    pub dropped: u64,
}

/// Explicit topic set (the implicit `all` topic is never stored) plus a
/// bounded FIFO per topic for messages that arrived while the owning session
/// could not receive them.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    policy: TopicPolicy,
    topics: BTreeSet<String>,
    backlog: HashMap<String, VecDeque<BacklogEntry>>,
    backlog_capacity: usize,
    next_index: u64,
    dropped: u64,
}

impl SubscriptionRegistry {
    pub fn new(policy: TopicPolicy, backlog_capacity: usize) -> Self {
        Self {
            policy,
            topics: BTreeSet::new(),
            backlog: HashMap::new(),
            backlog_capacity: backlog_capacity.max(1),
            next_index: 0,
            dropped: 0,
        }
    }

    pub fn from_config(cfg: &SubscriptionConfig) -> Self {
        Self::new(TopicPolicy::from_config(cfg), cfg.backlog_capacity)
    }

    /// Replace the explicit topic set. On error the current set is untouched.
    pub fn subscribe(&mut self, topics: &Value) -> Result<Vec<String>, SubscriptionError> {
        let mut parsed = self.policy.parse(topics)?;
        parsed.remove(ALL_TOPIC);
        self.topics = parsed;
        Ok(self.topics())
    }

    /// Remove the given topics from the explicit set; `all` cannot be left.
    pub fn unsubscribe(&mut self, topics: &Value) -> Result<Vec<String>, SubscriptionError> {
        let parsed = self.policy.parse(topics)?;
        for topic in &parsed {
            self.topics.remove(topic);
        }
        Ok(self.topics())
    }

    /// Effective membership, `all` first, then explicit topics in order.
    pub fn topics(&self) -> Vec<String> {
        std::iter::once(ALL_TOPIC.to_string())
            .chain(self.topics.iter().cloned())
            .collect()
    }

    pub fn explicit_topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        topic == ALL_TOPIC || self.topics.contains(topic)
    }

    pub fn record_while_disconnected(&mut self, topic: &str, payload: Value) -> RecordOutcome {
        self.next_index += 1;
        let entry = BacklogEntry {
            enqueue_index: self.next_index,
            topic: topic.to_string(),
            payload,
        };
        let queue = self.backlog.entry(topic.to_string()).or_default();
        let dropped = if queue.len() >= self.backlog_capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(entry);
        match dropped {
            Some(old) => {
                self.dropped += 1;
                RecordOutcome::RecordedWithDrop(old)
            }
            None => RecordOutcome::Recorded,
        }
    }

    /// Take every backlog entry for a currently subscribed topic in enqueue
    /// order and clear the whole backlog, including unsubscribed topics.
    pub fn drain_backlog(&mut self) -> Vec<BacklogEntry> {
        let mut drained: Vec<BacklogEntry> = self
            .backlog
            .drain()
            .filter(|(topic, _)| topic == ALL_TOPIC || self.topics.contains(topic))
            .flat_map(|(_, queue)| queue.into_iter())
            .collect();
        drained.sort_by_key(|entry| entry.enqueue_index);
        drained
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.values().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> BacklogStats {
        BacklogStats {
            entries: self.backlog_len(),
            topics: self.backlog.values().filter(|q| !q.is_empty()).count(),
            dropped: self.dropped,
        }
    }
}
