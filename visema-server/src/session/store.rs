// Concurrent registry of live sessions.

use super::{Session, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use visema_core::{Error, Result};

/// Maps session ids to sessions. Every operation is safe to call from any task.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. Ids are never reused, so a collision is a bug.
    pub fn register(&self, session: Session) -> Result<Arc<Session>> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => Err(Error::Internal(format!(
                "session id collision: {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                let session = Arc::new(session);
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove `id` and close it. Returns whether anything was removed.
    pub fn close(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.begin_close();
                session.mark_closed();
                true
            }
            None => false,
        }
    }

    /// Close every session that has had no transport for longer than `ttl`.
    pub fn reap_idle(&self, ttl: Duration, now: Instant) -> Vec<SessionId> {
        // Collect first: removing while iterating would deadlock the shard.
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| reapable(entry.value(), ttl, now))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                // re-check under the shard lock: a viewer may have attached meanwhile
                match self
                    .sessions
                    .remove_if(id, |_, session| reapable(session, ttl, now))
                {
                    Some((_, session)) => {
                        session.begin_close();
                        session.mark_closed();
                        true
                    }
                    None => false,
                }
            })
            .collect()
    }

    /// Close everything, used on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.close(id)).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// `try_attach` sets the flag before clearing `idle_since`
fn reapable(session: &Session, ttl: Duration, now: Instant) -> bool {
    !session.is_attached() && session.is_idle_longer_than(ttl, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use visema_core::{FrameGeometry, Timeline};

    fn session() -> Session {
        Session::new(
            SessionId::new(),
            None,
            Timeline::empty(),
            FrameGeometry::default(),
        )
    }

    #[test]
    fn test_register_and_get() {
        let store = SessionStore::new();
        let registered = store.register(session()).unwrap();
        let id = registered.id().clone();

        assert_eq!(store.len(), 1);
        assert!(store.contains(&id));
        assert!(Arc::ptr_eq(&store.get(&id).unwrap(), &registered));
        assert!(store.get(&SessionId::from("missing")).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = SessionStore::new();
        let id = SessionId::new();
        let geometry = FrameGeometry::default();
        store
            .register(Session::new(id.clone(), None, Timeline::empty(), geometry))
            .unwrap();
        let err = store
            .register(Session::new(id, None, Timeline::empty(), geometry))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = SessionStore::new();
        let s = store.register(session()).unwrap();
        let id = s.id().clone();

        assert!(store.close(&id));
        assert!(!store.close(&id));
        assert!(store.is_empty());
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_reap_skips_attached_sessions() {
        let store = SessionStore::new();
        let idle = store.register(session()).unwrap();
        let busy = store.register(session()).unwrap();
        assert!(busy.try_attach());

        let later = Instant::now() + Duration::from_secs(120);
        let reaped = store.reap_idle(Duration::from_secs(60), later);

        assert_eq!(reaped, vec![idle.id().clone()]);
        assert!(store.contains(busy.id()));
        assert!(!store.contains(idle.id()));
    }

    #[test]
    fn test_reap_skips_session_mid_attach() {
        let store = SessionStore::new();
        let s = store.register(session()).unwrap();
        // flag claimed, idle timestamp not yet cleared
        s.attached.store(true, std::sync::atomic::Ordering::Release);
        assert!(s.idle_since.lock().is_some());

        let later = Instant::now() + Duration::from_secs(120);
        assert!(store.reap_idle(Duration::from_secs(60), later).is_empty());
        assert!(store.contains(s.id()));
        assert_eq!(s.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_concurrent_register_and_close() {
        let store = Arc::new(SessionStore::new());
        let mut handles = vec![];

        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut ids = vec![];
                for _ in 0..50 {
                    ids.push(store.register(session()).unwrap().id().clone());
                }
                for id in ids.iter().step_by(2) {
                    assert!(store.close(id));
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 16 * 25);
        assert_eq!(store.close_all(), 16 * 25);
        assert!(store.is_empty());
    }
}
