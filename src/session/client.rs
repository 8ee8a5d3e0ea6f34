//! Client half of the recovery handshake.
//!
//! [`RecoveryClient`] holds what a client must remember across reconnects:
//! its session token, the last sequence it processed, the topics it wants,
//! and any chunked uploads the server has not confirmed. Feeding it server
//! events yields the client messages to send back.

use crate::session::events::{ClientMessage, ServerEvent, TransportEvent};
use crate::session::state::{ConnectionId, SequencedMessage, SessionId};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Disconnected,
    Recovering,
    Connected,
}

#[derive(Debug)]
pub struct RecoveryClient {
    session_id: Option<SessionId>,
    last_acked: u64,
    topics: BTreeSet<String>,
    phase: ClientPhase,
    recovery_requested: bool,
    delivered: Vec<SequencedMessage>,
    outgoing: HashMap<String, Vec<Vec<u8>>>,
    reconnections: u64,
}

impl Default for RecoveryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryClient {
    pub fn new() -> Self {
        Self {
            session_id: None,
            last_acked: 0,
            topics: BTreeSet::new(),
            phase: ClientPhase::Disconnected,
            recovery_requested: false,
            delivered: Vec::new(),
            outgoing: HashMap::new(),
            reconnections: 0,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections
    }

    /// Application messages in delivery order, duplicates removed.
    pub fn delivered(&self) -> &[SequencedMessage] {
        &self.delivered
    }

    /// Connect event for `connection`. A known session is resumed with the
    /// last acked sequence piggybacked as the recovery request.
    pub fn connect(&mut self, connection: ConnectionId) -> TransportEvent {
        let resuming = self.session_id.is_some();
        self.recovery_requested = resuming;
        TransportEvent::Connected {
            connection,
            session_token: self.session_id.as_ref().map(|id| id.to_string()),
            last_acked_sequence: resuming.then_some(self.last_acked),
        }
    }

    pub fn on_disconnect(&mut self) {
        self.phase = ClientPhase::Disconnected;
    }

    /// Replace the desired topic set; the returned request is also what gets
    /// replayed after a reconnect.
    pub fn subscribe<I, S>(&mut self, topics: I) -> ClientMessage
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self.subscribe_message()
    }

    /// Split `bytes` into `chunk_size` parts and remember them until the
    /// server reports the message reconstructed.
    pub fn send_chunked(
        &mut self,
        message_id: &str,
        bytes: &[u8],
        chunk_size: usize,
    ) -> Vec<ClientMessage> {
        let parts: Vec<Vec<u8>> = bytes
            .chunks(chunk_size.max(1))
            .map(<[u8]>::to_vec)
            .collect();
        let total = parts.len() as u32;
        self.outgoing.insert(message_id.to_string(), parts);
        (0..total)
            .filter_map(|i| self.chunk_message(message_id, i))
            .collect()
    }

    /// Chunk `index` of a pending upload, for selective re-sends.
    pub fn chunk_message(&self, message_id: &str, index: u32) -> Option<ClientMessage> {
        let parts = self.outgoing.get(message_id)?;
        let data = parts.get(index as usize)?.clone();
        Some(ClientMessage::Chunk {
            message_id: message_id.to_string(),
            chunk_index: index,
            total_chunks: parts.len() as u32,
            data,
        })
    }

    pub fn pending_uploads(&self) -> usize {
        self.outgoing.len()
    }

    pub fn on_event(&mut self, event: &ServerEvent) -> Vec<ClientMessage> {
        match event {
            ServerEvent::ConnectionState {
                session_id,
                is_reconnection,
                reconnection_count,
                ..
            } => {
                if !is_reconnection {
                    self.last_acked = 0;
                    self.delivered.clear();
                }
                self.session_id = Some(session_id.clone());
                self.reconnections = *reconnection_count;
                self.phase = ClientPhase::Connected;
                Vec::new()
            }
            ServerEvent::RecoveryPrompt { attempt, .. } => {
                self.phase = ClientPhase::Recovering;
                let mut reply = Vec::new();
                if !self.recovery_requested || *attempt > 1 {
                    self.recovery_requested = true;
                    reply.push(ClientMessage::RecoveryRequest {
                        last_acked_sequence: self.last_acked,
                    });
                }
                reply.push(self.subscribe_message());
                reply
            }
            ServerEvent::RecoveryData {
                pending_messages,
                server_sequence,
                ..
            } => {
                for message in pending_messages {
                    self.accept(message);
                }
                self.last_acked = self.last_acked.max(*server_sequence);
                vec![ClientMessage::Ack {
                    sequence: self.last_acked,
                }]
            }
            ServerEvent::Message(message) => {
                if self.accept(message) {
                    vec![ClientMessage::Ack {
                        sequence: message.sequence,
                    }]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::ChunkStatus(status) if !status.is_complete => status
                .missing_chunks
                .iter()
                .filter_map(|&i| self.chunk_message(&status.message_id, i))
                .collect(),
            ServerEvent::ChunkAck(ack) if ack.is_complete => {
                self.outgoing.remove(&ack.message_id);
                Vec::new()
            }
            ServerEvent::MessageReconstructed { message_id, .. } => {
                self.outgoing.remove(message_id);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn accept(&mut self, message: &SequencedMessage) -> bool {
        if message.sequence <= self.last_acked {
            return false;
        }
        self.last_acked = message.sequence;
        self.delivered.push(message.clone());
        true
    }

    fn subscribe_message(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            topics: Value::from(self.topics.iter().cloned().collect::<Vec<_>>()),
        }
    }
}
