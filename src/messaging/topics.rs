use crate::config::SubscriptionConfig;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

/// Implicit topic every session is a member of.
pub const ALL_TOPIC: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("topics must be a list of strings")]
    NotAList,
    #[error("topic at position {position} is not a string")]
    NonStringEntry { position: usize },
    #[error("topic {topic:?} is empty or longer than {max_len} bytes")]
    BadLength { topic: String, max_len: usize },
    #[error("topic {topic:?} contains characters outside [A-Za-z0-9_./:-]")]
    BadCharset { topic: String },
    #[error("{count} topics exceeds the limit of {max}")]
    TooMany { count: usize, max: usize },
}

/// Length, charset and count policy. A single bad entry rejects the whole
/// list.
#[derive(Debug, Clone)]
pub struct TopicPolicy {
    max_topics: usize,
    max_topic_len: usize,
}

impl TopicPolicy {
    pub fn new(max_topics: usize, max_topic_len: usize) -> Self {
        Self {
            max_topics,
            max_topic_len,
        }
    }

    pub fn from_config(cfg: &SubscriptionConfig) -> Self {
        Self::new(cfg.max_topics, cfg.max_topic_len)
    }

    /// Parse an untyped `topics` field into a validated set.
    ///
    /// Duplicates collapse; the count limit applies to distinct names.
    pub fn parse(&self, value: &Value) -> Result<BTreeSet<String>, SubscriptionError> {
        let Value::Array(items) = value else {
            return Err(SubscriptionError::NotAList);
        };
        let mut topics = BTreeSet::new();
        for (position, item) in items.iter().enumerate() {
            let Value::String(topic) = item else {
                return Err(SubscriptionError::NonStringEntry { position });
            };
            self.validate_topic(topic)?;
            topics.insert(topic.clone());
        }
        if topics.len() > self.max_topics {
            return Err(SubscriptionError::TooMany {
                count: topics.len(),
                max: self.max_topics,
            });
        }
        Ok(topics)
    }

    pub fn validate_topic(&self, topic: &str) -> Result<(), SubscriptionError> {
        if topic.is_empty() || topic.len() > self.max_topic_len {
            return Err(SubscriptionError::BadLength {
                topic: topic.to_string(),
                max_len: self.max_topic_len,
            });
        }
        if !topic.chars().all(is_topic_char) {
            return Err(SubscriptionError::BadCharset {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }
}

fn is_topic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':')
}
