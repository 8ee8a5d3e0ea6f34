//! Chunked message transfer with missing-chunk detection.
//!
//! Chunks are addressed by index, so arrival order does not matter. A sender
//! that lost track of what arrived asks [`ChunkStore::query_status`] and
//! re-sends only the missing indices. Reconstruction runs exactly once, on the
//! chunk that fills the last empty slot. A transfer whose payload fails to
//! decode stays in the store in the `Failed` state so the failure can be told
//! apart from a transfer that is still missing chunks.

use crate::config::ChunkConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk index {index} out of range [0, {total}) for message {message_id}")]
    InvalidIndex {
        message_id: String,
        index: u32,
        total: u32,
    },
    #[error("message {message_id} declared {declared} chunks but transfer expects {expected}")]
    InconsistentTotal {
        message_id: String,
        expected: u32,
        declared: u32,
    },
    #[error("no transfer in progress for message {message_id}")]
    UnknownTransfer { message_id: String },
    #[error("transfer {message_id} rejected: {reason}")]
    TransferLimit { message_id: String, reason: String },
    #[error("transfer {message_id} abandoned after {idle_ms}ms without a chunk")]
    TimedOut { message_id: String, idle_ms: u64 },
    #[error("transfer {message_id} still missing {missing} chunks")]
    Incomplete { message_id: String, missing: usize },
    #[error("reconstruction of {message_id} failed: {reason}")]
    ReconstructionFailed { message_id: String, reason: String },
}

/// Decodes a reassembled byte payload into an application message.
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Value, String>;
}

/// Decodes reassembled bytes as a JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl PayloadDecoder for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Value, String> {
        serde_json::from_slice(bytes).map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub message_id: String,
    pub chunk_index: u32,
    pub received_count: u32,
    pub total_chunks: u32,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatus {
    pub message_id: String,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reassembled {
    pub message_id: String,
    pub bytes: Vec<u8>,
    pub message: Value,
}

/// Outcome of storing one chunk. `reconstruction` is set only on the chunk
/// that completed the transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReceipt {
    pub ack: ChunkAck,
    pub reconstruction: Option<Result<Reassembled, ChunkError>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Receiving,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    message_id: String,
    total_chunks: u32,
    slots: Vec<Option<Vec<u8>>>,
    received_count: u32,
    bytes: usize,
    received_at: Instant,
    last_activity: Instant,
    state: TransferState,
}

impl ChunkedTransfer {
    fn new(message_id: &str, total_chunks: u32, now: Instant) -> Self {
        Self {
            message_id: message_id.to_string(),
            total_chunks,
            slots: vec![None; total_chunks as usize],
            received_count: 0,
            bytes: 0,
            received_at: now,
            last_activity: now,
            state: TransferState::Receiving,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    pub fn missing(&self) -> Vec<u32> {
        self.indices(Option::is_none)
    }

    pub fn received(&self) -> Vec<u32> {
        self.indices(Option::is_some)
    }

    pub fn status(&self) -> ChunkStatus {
        ChunkStatus {
            message_id: self.message_id.clone(),
            received_chunks: self.received(),
            missing_chunks: self.missing(),
            is_complete: self.is_complete(),
        }
    }

    fn indices(&self, pick: impl Fn(&Option<Vec<u8>>) -> bool) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| pick(slot))
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn ack(&self, chunk_index: u32) -> ChunkAck {
        ChunkAck {
            message_id: self.message_id.clone(),
            chunk_index,
            received_count: self.received_count,
            total_chunks: self.total_chunks,
            is_complete: self.is_complete(),
        }
    }

    fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for slot in self.slots.iter().flatten() {
            out.extend_from_slice(slot);
        }
        out
    }
}

/// In-progress transfers for one session, keyed by message id.
pub struct ChunkStore {
    config: ChunkConfig,
    decoder: Arc<dyn PayloadDecoder>,
    transfers: HashMap<String, ChunkedTransfer>,
    completed: VecDeque<(String, u32)>,
    completed_ids: HashSet<String>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("transfers", &self.transfers.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

impl ChunkStore {
    pub fn new(config: ChunkConfig, decoder: Arc<dyn PayloadDecoder>) -> Self {
        Self {
            config,
            decoder,
            transfers: HashMap::new(),
            completed: VecDeque::new(),
            completed_ids: HashSet::new(),
        }
    }

    pub fn receive_chunk(
        &mut self,
        message_id: &str,
        index: u32,
        total: u32,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<ChunkReceipt, ChunkError> {
        if let Some(transfer) = self.transfers.get(message_id) {
            if transfer.total_chunks != total {
                return Err(ChunkError::InconsistentTotal {
                    message_id: message_id.to_string(),
                    expected: transfer.total_chunks,
                    declared: total,
                });
            }
        }
        if index >= total {
            return Err(ChunkError::InvalidIndex {
                message_id: message_id.to_string(),
                index,
                total,
            });
        }
        if let Some(ack) = self.completed_ack(message_id, index, total)? {
            return Ok(ChunkReceipt {
                ack,
                reconstruction: None,
            });
        }
        if !self.transfers.contains_key(message_id) {
            self.admit(message_id, total)?;
            self.transfers.insert(
                message_id.to_string(),
                ChunkedTransfer::new(message_id, total, now),
            );
        }

        let max_bytes = self.config.max_transfer_bytes;
        let Some(transfer) = self.transfers.get_mut(message_id) else {
            return Err(ChunkError::UnknownTransfer {
                message_id: message_id.to_string(),
            });
        };
        let was_complete = transfer.is_complete();
        let previous = transfer.slots[index as usize].as_ref().map(Vec::len);
        let next_bytes = transfer.bytes - previous.unwrap_or(0) + payload.len();
        if next_bytes > max_bytes {
            return Err(ChunkError::TransferLimit {
                message_id: message_id.to_string(),
                reason: format!("{next_bytes} bytes exceeds {max_bytes}"),
            });
        }
        if previous.is_none() {
            transfer.received_count += 1;
        }
        transfer.slots[index as usize] = Some(payload);
        transfer.bytes = next_bytes;
        transfer.last_activity = now;
        let ack = transfer.ack(index);
        tracing::debug!(
            message_id,
            index,
            received = ack.received_count,
            total,
            "chunk stored"
        );

        let reconstruction = if ack.is_complete && !was_complete {
            Some(self.reconstruct(message_id))
        } else {
            None
        };
        Ok(ChunkReceipt {
            ack,
            reconstruction,
        })
    }

    pub fn query_status(&self, message_id: &str) -> Result<ChunkStatus, ChunkError> {
        if let Some(transfer) = self.transfers.get(message_id) {
            return Ok(transfer.status());
        }
        if let Some((_, total)) = self.completed.iter().find(|(id, _)| id == message_id) {
            return Ok(ChunkStatus {
                message_id: message_id.to_string(),
                received_chunks: (0..*total).collect(),
                missing_chunks: Vec::new(),
                is_complete: true,
            });
        }
        Err(ChunkError::UnknownTransfer {
            message_id: message_id.to_string(),
        })
    }

    /// Concatenate a complete transfer in index order and decode it.
    ///
    /// Success removes the transfer; decode failure marks it `Failed` and
    /// keeps it for inspection.
    pub fn reconstruct(&mut self, message_id: &str) -> Result<Reassembled, ChunkError> {
        let Some(transfer) = self.transfers.get_mut(message_id) else {
            return Err(ChunkError::UnknownTransfer {
                message_id: message_id.to_string(),
            });
        };
        if !transfer.is_complete() {
            return Err(ChunkError::Incomplete {
                message_id: message_id.to_string(),
                missing: (transfer.total_chunks - transfer.received_count) as usize,
            });
        }
        let bytes = transfer.concat();
        match self.decoder.decode(&bytes) {
            Ok(message) => {
                let total = transfer.total_chunks;
                self.transfers.remove(message_id);
                self.remember_completed(message_id, total);
                Ok(Reassembled {
                    message_id: message_id.to_string(),
                    bytes,
                    message,
                })
            }
            Err(reason) => {
                tracing::warn!(message_id, %reason, "chunked payload failed to decode");
                transfer.state = TransferState::Failed {
                    reason: reason.clone(),
                };
                Err(ChunkError::ReconstructionFailed {
                    message_id: message_id.to_string(),
                    reason,
                })
            }
        }
    }

    pub fn abandon(&mut self, message_id: &str) -> Result<ChunkedTransfer, ChunkError> {
        self.transfers
            .remove(message_id)
            .ok_or_else(|| ChunkError::UnknownTransfer {
                message_id: message_id.to_string(),
            })
    }

    /// Abandon incomplete transfers idle for longer than the configured timeout.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.config.transfer_timeout();
        let mut expired = Vec::new();
        self.transfers.retain(|id, transfer| {
            let idle = now.saturating_duration_since(transfer.last_activity) >= timeout;
            if idle {
                expired.push(id.clone());
            }
            !idle
        });
        expired.sort();
        expired
    }

    /// Restart idle clocks, used when a session resumes after a disconnect.
    pub fn touch_all(&mut self, now: Instant) {
        for transfer in self.transfers.values_mut() {
            transfer.last_activity = now;
        }
    }

    /// Status of every transfer still waiting on chunks, ordered by id.
    pub fn incomplete(&self) -> Vec<ChunkStatus> {
        let mut statuses: Vec<_> = self
            .transfers
            .values()
            .filter(|t| !t.is_complete())
            .map(ChunkedTransfer::status)
            .collect();
        statuses.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        statuses
    }

    pub fn transfer(&self, message_id: &str) -> Option<&ChunkedTransfer> {
        self.transfers.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    fn admit(&self, message_id: &str, total: u32) -> Result<(), ChunkError> {
        if total > self.config.max_total_chunks {
            return Err(ChunkError::TransferLimit {
                message_id: message_id.to_string(),
                reason: format!(
                    "{total} chunks exceeds {}",
                    self.config.max_total_chunks
                ),
            });
        }
        if self.transfers.len() >= self.config.max_pending_transfers {
            return Err(ChunkError::TransferLimit {
                message_id: message_id.to_string(),
                reason: format!(
                    "{} transfers already pending",
                    self.config.max_pending_transfers
                ),
            });
        }
        Ok(())
    }

    fn completed_ack(
        &self,
        message_id: &str,
        index: u32,
        total: u32,
    ) -> Result<Option<ChunkAck>, ChunkError> {
        if !self.completed_ids.contains(message_id) {
            return Ok(None);
        }
        let expected = self
            .completed
            .iter()
            .find(|(id, _)| id == message_id)
            .map_or(total, |(_, t)| *t);
        if expected != total {
            return Err(ChunkError::InconsistentTotal {
                message_id: message_id.to_string(),
                expected,
                declared: total,
            });
        }
        Ok(Some(ChunkAck {
            message_id: message_id.to_string(),
            chunk_index: index,
            received_count: total,
            total_chunks: total,
            is_complete: true,
        }))
    }

    fn remember_completed(&mut self, message_id: &str, total: u32) {
        if self.config.completed_memory == 0 {
            return;
        }
        if self.completed.len() >= self.config.completed_memory {
            if let Some((old, _)) = self.completed.pop_front() {
                self.completed_ids.remove(&old);
            }
        }
        self.completed.push_back((message_id.to_string(), total));
        self.completed_ids.insert(message_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> ChunkStore {
        ChunkStore::new(ChunkConfig::default(), Arc::new(JsonDecoder))
    }

    fn split(payload: &[u8], parts: usize) -> Vec<Vec<u8>> {
        let size = payload.len().div_ceil(parts);
        payload.chunks(size).map(<[u8]>::to_vec).collect()
    }

    #[test]
    fn test_out_of_order_chunks_reassemble() {
        let now = Instant::now();
        let mut store = store();
        let original = serde_json::to_vec(&json!({"text": "hello chunked world"})).unwrap();
        let parts = split(&original, 3);
        let first = store.receive_chunk("m1", 2, 3, parts[2].clone(), now).unwrap();
        assert_eq!(first.ack.received_count, 1);
        assert!(first.reconstruction.is_none());
        store.receive_chunk("m1", 0, 3, parts[0].clone(), now).unwrap();
        let last = store.receive_chunk("m1", 1, 3, parts[1].clone(), now).unwrap();
        assert!(last.ack.is_complete);
        let reassembled = last.reconstruction.unwrap().unwrap();
        assert_eq!(reassembled.bytes, original);
        assert_eq!(reassembled.message, json!({"text": "hello chunked world"}));
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_chunk_does_not_change_count() {
        let now = Instant::now();
        let mut store = store();
        store.receive_chunk("m", 0, 3, b"[1,".to_vec(), now).unwrap();
        let again = store.receive_chunk("m", 0, 3, b"[1,".to_vec(), now).unwrap();
        assert_eq!(again.ack.received_count, 1);
        assert!(!again.ack.is_complete);
    }

    #[test]
    fn test_resent_chunk_replaces_byte_count() {
        let now = Instant::now();
        let cfg = ChunkConfig {
            max_transfer_bytes: 6,
            ..ChunkConfig::default()
        };
        let mut store = ChunkStore::new(cfg, Arc::new(JsonDecoder));
        store.receive_chunk("m", 0, 2, b"[1234".to_vec(), now).unwrap();
        let resent = store.receive_chunk("m", 0, 2, b"[1".to_vec(), now).unwrap();
        assert_eq!(resent.ack.received_count, 1);
        assert_eq!(store.transfer("m").unwrap().bytes, 2);
        let last = store.receive_chunk("m", 1, 2, b"]".to_vec(), now).unwrap();
        assert_eq!(last.reconstruction.unwrap().unwrap().message, json!([1]));
    }

    #[test]
    fn test_invalid_index_and_total() {
        let now = Instant::now();
        let mut store = store();
        assert!(matches!(
            store.receive_chunk("m", 3, 3, vec![], now),
            Err(ChunkError::InvalidIndex { index: 3, total: 3, .. })
        ));
        assert!(store.is_empty());
        store.receive_chunk("m", 0, 3, b"1".to_vec(), now).unwrap();
        assert!(matches!(
            store.receive_chunk("m", 1, 4, b"2".to_vec(), now),
            Err(ChunkError::InconsistentTotal {
                expected: 3,
                declared: 4,
                ..
            })
        ));
        assert_eq!(store.query_status("m").unwrap().received_chunks, vec![0]);
    }

    #[test]
    fn test_zero_total_is_invalid_index() {
        let mut store = store();
        assert!(matches!(
            store.receive_chunk("m", 0, 0, vec![], Instant::now()),
            Err(ChunkError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn test_query_status_reports_missing() {
        let now = Instant::now();
        let mut store = store();
        for i in [0u32, 1, 3] {
            store.receive_chunk("m", i, 5, b"x".to_vec(), now).unwrap();
        }
        let status = store.query_status("m").unwrap();
        assert_eq!(status.missing_chunks, vec![2, 4]);
        assert_eq!(status.received_chunks, vec![0, 1, 3]);
        assert!(!status.is_complete);
        assert!(matches!(
            store.query_status("nope"),
            Err(ChunkError::UnknownTransfer { .. })
        ));
    }

    #[test]
    fn test_decode_failure_keeps_transfer() {
        let now = Instant::now();
        let mut store = store();
        store.receive_chunk("bad", 0, 2, b"{not".to_vec(), now).unwrap();
        let receipt = store.receive_chunk("bad", 1, 2, b" json".to_vec(), now).unwrap();
        assert!(matches!(
            receipt.reconstruction,
            Some(Err(ChunkError::ReconstructionFailed { .. }))
        ));
        let transfer = store.transfer("bad").unwrap();
        assert!(matches!(transfer.state(), TransferState::Failed { .. }));
        let status = store.query_status("bad").unwrap();
        assert!(status.is_complete);
        assert!(status.missing_chunks.is_empty());

        let resent = store.receive_chunk("bad", 1, 2, b" json".to_vec(), now).unwrap();
        assert!(resent.reconstruction.is_none());
    }

    #[test]
    fn test_late_duplicate_after_completion_is_acknowledged() {
        let now = Instant::now();
        let mut store = store();
        store.receive_chunk("m", 0, 2, b"[1".to_vec(), now).unwrap();
        store.receive_chunk("m", 1, 2, b"]".to_vec(), now).unwrap();
        let late = store.receive_chunk("m", 0, 2, b"[1".to_vec(), now).unwrap();
        assert!(late.ack.is_complete);
        assert!(late.reconstruction.is_none());
        assert!(store.is_empty());
        assert!(store.query_status("m").unwrap().is_complete);
    }

    #[test]
    fn test_limits() {
        let now = Instant::now();
        let cfg = ChunkConfig {
            max_total_chunks: 4,
            max_transfer_bytes: 4,
            max_pending_transfers: 1,
            ..ChunkConfig::default()
        };
        let mut store = ChunkStore::new(cfg, Arc::new(JsonDecoder));
        assert!(matches!(
            store.receive_chunk("big", 0, 5, vec![], now),
            Err(ChunkError::TransferLimit { .. })
        ));
        store.receive_chunk("a", 0, 2, b"abc".to_vec(), now).unwrap();
        assert!(matches!(
            store.receive_chunk("b", 0, 2, vec![], now),
            Err(ChunkError::TransferLimit { .. })
        ));
        assert!(matches!(
            store.receive_chunk("a", 1, 2, b"de".to_vec(), now),
            Err(ChunkError::TransferLimit { .. })
        ));
        assert_eq!(store.query_status("a").unwrap().missing_chunks, vec![1]);
    }

    #[test]
    fn test_idle_expiry_and_touch() {
        let start = Instant::now();
        let cfg = ChunkConfig {
            transfer_timeout_ms: 1_000,
            ..ChunkConfig::default()
        };
        let mut store = ChunkStore::new(cfg, Arc::new(JsonDecoder));
        store.receive_chunk("a", 0, 2, b"1".to_vec(), start).unwrap();
        store.receive_chunk("b", 0, 2, b"1".to_vec(), start).unwrap();
        let later = start + Duration::from_millis(900);
        store.touch_all(later);
        assert!(store.expire_idle(start + Duration::from_millis(1_500)).is_empty());
        assert_eq!(
            store.expire_idle(later + Duration::from_millis(1_000)),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_abandon() {
        let mut store = store();
        store
            .receive_chunk("a", 0, 2, b"1".to_vec(), Instant::now())
            .unwrap();
        assert_eq!(store.abandon("a").unwrap().received_count(), 1);
        assert!(store.abandon("a").is_err());
    }
}
