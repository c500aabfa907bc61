//! Process-wide table of live sessions, keyed by remote node id.
//!
//! Many readers (handlers, discovery, introspection) and rare writers
//! (register/unregister). Every operation is a single short critical
//! section; no lock is ever held across I/O — callers snapshot, release,
//! then act.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::P2pError;
use crate::session::{Session, SessionRole};
use crate::types::NodeId;

pub struct SessionRegistry {
    /// Admission cap for server-accepted sessions.
    max_connections: usize,
    sessions: RwLock<HashMap<NodeId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self { max_connections, sessions: RwLock::new(HashMap::new()) }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admit a session. Never replaces an existing entry — the caller closes
    /// the new session on `DuplicateNodeId`. Server-accepted sessions are
    /// additionally refused once the registry is at capacity; outbound
    /// connections are throttled by the discovery worker instead.
    pub fn register(&self, session: Arc<Session>) -> Result<(), P2pError> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&session.node_id()) {
            return Err(P2pError::DuplicateNodeId);
        }
        if session.role() == SessionRole::Server && sessions.len() >= self.max_connections {
            return Err(P2pError::RegistryFull);
        }
        debug!(
            peer = %session.node_id(),
            role = ?session.role(),
            total = sessions.len() + 1,
            "session registered"
        );
        sessions.insert(session.node_id(), session);
        Ok(())
    }

    /// Remove a session, but only the exact handle that was registered: a
    /// rejected duplicate tearing itself down must not evict the original.
    pub fn unregister(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(&session.node_id()) {
            Some(existing) if Arc::ptr_eq(existing, session) => {
                sessions.remove(&session.node_id());
                debug!(peer = %session.node_id(), total = sessions.len(), "session unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.sessions.read().unwrap().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Copy of the current sessions; the lock is released before the caller
    /// touches any of them.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.sessions.read().unwrap().keys().copied().collect()
    }

    /// Close and remove the session for `node_id`, if any.
    pub fn disconnect(&self, node_id: &NodeId) -> bool {
        let removed = self.sessions.write().unwrap().remove(node_id);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every session and empty the table. Part of manager shutdown.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RemoteIdentity, SessionState};
    use crate::types::NodeType;
    use tokio::sync::mpsc;

    fn session_with(node_id: NodeId, role: SessionRole) -> Arc<Session> {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let remote = RemoteIdentity {
            node_id,
            node_type: NodeType::Normal,
            server_port: 9000,
            address: "127.0.0.1".parse().unwrap(),
        };
        let session = Arc::new(Session::new(remote, role, out_tx));
        session.mark_open();
        session
    }

    #[test]
    fn register_rejects_duplicate_id() {
        let registry = SessionRegistry::new(10);
        let id = NodeId::random();
        registry.register(session_with(id, SessionRole::Client)).unwrap();

        let dup = session_with(id, SessionRole::Server);
        assert!(matches!(registry.register(Arc::clone(&dup)), Err(P2pError::DuplicateNodeId)));
        assert_eq!(registry.len(), 1);

        // The losing duplicate must not be able to evict the original.
        assert!(!registry.unregister(&dup));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn admission_cap_applies_to_server_sessions() {
        let registry = SessionRegistry::new(2);
        registry.register(session_with(NodeId::random(), SessionRole::Server)).unwrap();
        registry.register(session_with(NodeId::random(), SessionRole::Server)).unwrap();

        assert!(matches!(
            registry.register(session_with(NodeId::random(), SessionRole::Server)),
            Err(P2pError::RegistryFull)
        ));
        assert_eq!(registry.len(), 2);

        // Outbound sessions are not subject to the cap.
        registry.register(session_with(NodeId::random(), SessionRole::Client)).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn one_below_cap_still_admits() {
        let registry = SessionRegistry::new(2);
        registry.register(session_with(NodeId::random(), SessionRole::Server)).unwrap();
        assert!(registry.register(session_with(NodeId::random(), SessionRole::Server)).is_ok());
    }

    #[test]
    fn disconnect_closes_and_removes() {
        let registry = SessionRegistry::new(10);
        let id = NodeId::random();
        let session = session_with(id, SessionRole::Client);
        registry.register(Arc::clone(&session)).unwrap();

        assert!(registry.disconnect(&id));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(!registry.contains(&id));
        assert!(!registry.disconnect(&id));
    }

    #[test]
    fn close_all_empties_the_table() {
        let registry = SessionRegistry::new(10);
        let sessions: Vec<_> = (0..3)
            .map(|_| {
                let s = session_with(NodeId::random(), SessionRole::Client);
                registry.register(Arc::clone(&s)).unwrap();
                s
            })
            .collect();

        registry.close_all();
        assert!(registry.is_empty());
        for s in sessions {
            assert_eq!(s.state(), SessionState::Closing);
        }
    }
}
