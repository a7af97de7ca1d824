// Online session registry
//
// Process-wide map of live sessions and the sole authority for liveness:
// a persisted row saying online without a registry entry means a crashed
// or migrated instance. Tests inject their own instance; the process
// default lives behind a Lazy.

use dashmap::DashMap;
use log::debug;
use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::session::Session;

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Registry> {
        Arc::clone(&GLOBAL)
    }

    pub fn store(&self, session: Arc<Session>) {
        debug!("registry store {}", session.id);
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn delete(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!("registry delete {}", session_id);
        }
    }

    pub fn get_by_id(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Visit every online session. No iteration order is promised.
    pub fn range<F: FnMut(&Arc<Session>)>(&self, mut f: F) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drain every session at process shutdown by cancelling their away
    /// tokens; the multiplexers run their own teardown.
    pub fn drain(&self) {
        for entry in self.sessions.iter() {
            entry.value().chans.away.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionMeta};

    fn make_session(id: &str) -> Arc<Session> {
        let (session, _rx) = Session::new(SessionMeta {
            session_id: id.to_string(),
            ..SessionMeta::default()
        });
        session
    }

    #[test]
    fn test_store_get_delete() {
        let registry = Registry::new();
        registry.store(make_session("s1"));

        assert!(registry.get_by_id("s1").is_some());
        assert!(registry.get_by_id("s2").is_none());

        registry.delete("s1");
        assert!(registry.get_by_id("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_range_visits_all() {
        let registry = Registry::new();
        registry.store(make_session("a"));
        registry.store(make_session("b"));

        let mut seen = Vec::new();
        registry.range(|s| seen.push(s.id.clone()));
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_drain_cancels_away() {
        let registry = Registry::new();
        let session = make_session("a");
        registry.store(Arc::clone(&session));
        registry.drain();
        assert!(session.chans.away.is_cancelled());
    }
}
