//! Process-wide registry of live sessions.
//!
//! The registry references sessions, it does not own them: removing an entry
//! is always paired with the caller's cleanup (cancel/kill, temp-dir
//! removal). Clones share state, so the router and the shutdown coordinator
//! see the same maps.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::Mutex;

use crate::agent::AgentSession;
use crate::shell::ShellSession;

#[derive(Default)]
pub struct SessionRegistry {
    agents: Arc<Mutex<HashMap<String, Arc<AgentSession>>>>,
    shells: Arc<Mutex<HashMap<String, Arc<ShellSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_agent(&self, session: Arc<AgentSession>) {
        let mut agents = self.agents.lock().await;
        debug!("Registering agent session {}", session.session_id);
        agents.insert(session.session_id.clone(), session);
    }

    pub async fn get_agent(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        self.agents.lock().await.get(session_id).cloned()
    }

    pub async fn remove_agent(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        let removed = self.agents.lock().await.remove(session_id);
        if removed.is_some() {
            debug!("Removed agent session {}", session_id);
        }
        removed
    }

    pub async fn agents(&self) -> Vec<Arc<AgentSession>> {
        self.agents.lock().await.values().cloned().collect()
    }

    pub async fn agents_for_user(&self, user_id: &str) -> Vec<Arc<AgentSession>> {
        self.agents
            .lock()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn put_shell(&self, session: Arc<ShellSession>) {
        let mut shells = self.shells.lock().await;
        debug!("Registering shell session {}", session.id);
        shells.insert(session.id.clone(), session);
    }

    pub async fn get_shell(&self, shell_id: &str) -> Option<Arc<ShellSession>> {
        self.shells.lock().await.get(shell_id).cloned()
    }

    pub async fn remove_shell(&self, shell_id: &str) -> Option<Arc<ShellSession>> {
        let removed = self.shells.lock().await.remove(shell_id);
        if removed.is_some() {
            debug!("Removed shell session {}", shell_id);
        }
        removed
    }

    pub async fn shells(&self) -> Vec<Arc<ShellSession>> {
        self.shells.lock().await.values().cloned().collect()
    }

    pub async fn shells_for_user(&self, user_id: &str) -> Vec<Arc<ShellSession>> {
        self.shells
            .lock()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl Clone for SessionRegistry {
    fn clone(&self) -> Self {
        Self {
            agents: Arc::clone(&self.agents),
            shells: Arc::clone(&self.shells),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let registry = SessionRegistry::new();
        let session = AgentSession::new("s1", "u1", "p1", "/tmp");

        registry.put_agent(session.clone()).await;
        assert!(registry.get_agent("s1").await.is_some());
        assert!(registry.get_agent("s2").await.is_none());

        assert!(registry.remove_agent("s1").await.is_some());
        assert!(registry.get_agent("s1").await.is_none());
        assert!(registry.remove_agent("s1").await.is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let registry = SessionRegistry::new();
        let clone = registry.clone();

        registry
            .put_agent(AgentSession::new("s1", "u1", "p1", "/tmp"))
            .await;
        assert!(clone.get_agent("s1").await.is_some());
    }

    #[tokio::test]
    async fn filter_by_user() {
        let registry = SessionRegistry::new();
        registry
            .put_agent(AgentSession::new("s1", "alice", "p1", "/tmp"))
            .await;
        registry
            .put_agent(AgentSession::new("s2", "bob", "p1", "/tmp"))
            .await;
        registry
            .put_agent(AgentSession::new("s3", "alice", "p2", "/tmp"))
            .await;

        let alice = registry.agents_for_user("alice").await;
        assert_eq!(alice.len(), 2);
        assert!(registry.agents_for_user("carol").await.is_empty());
    }
}
