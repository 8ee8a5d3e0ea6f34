use crate::config::Config;
use crate::messaging::PayloadDecoder;
use crate::session::state::{ConnectionId, Session, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SessionHandle = Arc<Mutex<Session>>;

/// Owns every live session and the connection → session binding.
///
/// Each session sits behind its own lock; the manager itself only guards the
/// two maps and is never held across an await.
pub struct SessionManager {
    config: Config,
    decoder: Arc<dyn PayloadDecoder>,
    sessions: HashMap<SessionId, SessionHandle>,
    connections: HashMap<ConnectionId, SessionId>,
}

impl SessionManager {
    pub fn new(config: Config, decoder: Arc<dyn PayloadDecoder>) -> Self {
        Self {
            config,
            decoder,
            sessions: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Create a connected session with a freshly minted id, bound to
    /// `connection`.
    pub fn create(&mut self, connection: ConnectionId) -> (SessionId, SessionHandle) {
        let id = SessionId::generate();
        let session = Session::new(id.clone(), connection, &self.config, self.decoder.clone());
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(id.clone(), handle.clone());
        self.connections.insert(connection, id.clone());
        (id, handle)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).cloned()
    }

    pub fn by_connection(&self, connection: ConnectionId) -> Option<(SessionId, SessionHandle)> {
        let id = self.connections.get(&connection)?;
        self.sessions.get(id).map(|h| (id.clone(), h.clone()))
    }

    pub fn bind(&mut self, connection: ConnectionId, id: SessionId) {
        self.connections.insert(connection, id);
    }

    pub fn unbind(&mut self, connection: ConnectionId) -> Option<SessionId> {
        self.connections.remove(&connection)
    }

    /// Drop a session and every connection still pointing at it.
    pub fn remove(&mut self, id: &SessionId) -> Option<SessionHandle> {
        self.connections.retain(|_, bound| bound != id);
        self.sessions.remove(id)
    }

    pub fn all(&self) -> Vec<(SessionId, SessionHandle)> {
        let mut all: Vec<_> = self
            .sessions
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
