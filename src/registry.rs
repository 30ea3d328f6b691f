use std::collections::HashMap;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

/// Control side of a spawned capture process.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Asks the process to shut down gracefully. Errors when the process is
    /// already gone.
    fn terminate(&mut self) -> std::io::Result<()>;
}

pub struct ActiveSession {
    pub session_id: Uuid,
    pub handle: Box<dyn ProcessHandle>,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
}

impl ActiveSession {
    pub fn new(handle: Box<dyn ProcessHandle>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            handle,
            started_at: Instant::now(),
            started_wall: Utc::now(),
        }
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("session_id", &self.session_id)
            .field("pid", &self.handle.pid())
            .field("started_wall", &self.started_wall)
            .finish()
    }
}

/// Camera id -> currently owned capture process. Holds at most one session
/// per camera; callers serialize access.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    sessions: HashMap<String, ActiveSession>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, camera_id: &str) -> Option<&ActiveSession> {
        self.sessions.get(camera_id)
    }

    pub fn contains(&self, camera_id: &str) -> bool {
        self.sessions.contains_key(camera_id)
    }

    /// Registers a session. Returns the displaced session if the caller broke
    /// the stop-before-start rule, so it can still be terminated.
    pub fn insert(&mut self, camera_id: &str, session: ActiveSession) -> Option<ActiveSession> {
        self.sessions.insert(camera_id.to_string(), session)
    }

    pub fn remove(&mut self, camera_id: &str) -> Option<ActiveSession> {
        self.sessions.remove(camera_id)
    }

    /// Removes the entry only if it still belongs to `session_id`.
    pub fn remove_if_session(&mut self, camera_id: &str, session_id: Uuid) -> Option<ActiveSession> {
        match self.sessions.get(camera_id) {
            Some(session) if session.session_id == session_id => self.sessions.remove(camera_id),
            _ => None,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandle;

    impl ProcessHandle for NullHandle {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_one_entry_per_camera() {
        let mut registry = ProcessRegistry::new();
        assert!(registry.insert("cam", ActiveSession::new(Box::new(NullHandle))).is_none());
        let displaced = registry.insert("cam", ActiveSession::new(Box::new(NullHandle)));
        assert!(displaced.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_if_session_ignores_stale_ids() {
        let mut registry = ProcessRegistry::new();
        let old = ActiveSession::new(Box::new(NullHandle));
        let old_id = old.session_id;
        registry.insert("cam", old);
        registry.remove("cam");

        let new = ActiveSession::new(Box::new(NullHandle));
        let new_id = new.session_id;
        registry.insert("cam", new);

        assert!(registry.remove_if_session("cam", old_id).is_none());
        assert!(registry.contains("cam"));
        assert!(registry.remove_if_session("cam", new_id).is_some());
        assert!(registry.is_empty());
    }
}
