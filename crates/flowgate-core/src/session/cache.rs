//! In-memory session store with idle-time eviction.
//!
//! The cache is an access optimization over the durable record store, so
//! eviction loses no data; an evicted session is rebuilt on demand. Reads
//! touch the entry. Staleness is purged opportunistically on the write
//! paths rather than by a background task.

use crate::models::Session;
use dashmap::DashMap;
use tracing::debug;

pub struct SessionCache {
    ttl_ms: i64,
    sessions: DashMap<String, Session>,
}

impl SessionCache {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            ttl_ms: ttl_minutes * 60_000,
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Fetch a session, refreshing its idle clock.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get_mut(id).map(|mut entry| {
            entry.touch();
            entry.clone()
        })
    }

    /// Mutate a session in place, refreshing its idle clock.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        self.sessions.get_mut(id).map(|mut entry| {
            f(&mut entry);
            entry.touch();
            entry.clone()
        })
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Evict sessions idle past the TTL, returning their ids so callers can
    /// drop dependent state.
    pub fn purge_stale(&self) -> Vec<String> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut evicted = Vec::new();
        self.sessions.retain(|id, session| {
            // Clock skew reads as freshly touched rather than ancient.
            let idle = (now - session.touched_at).max(0);
            if idle > self.ttl_ms {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    fn age(&self, id: &str, millis: i64) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.touched_at -= millis;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SandboxHandle;

    fn session(id: &str) -> Session {
        Session::initiating(id, "unit-1", SandboxHandle::new("sbx-1", "/workspace"))
    }

    #[test]
    fn get_touches_and_keeps_sessions_alive() {
        let cache = SessionCache::new(1);
        cache.insert(session("s1"));
        cache.age("s1", 50_000);

        // A read within the TTL resets the idle clock.
        assert!(cache.get("s1").is_some());
        cache.age("s1", 50_000);
        assert!(cache.purge_stale().is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_evicts_idle_sessions_only() {
        let cache = SessionCache::new(1);
        cache.insert(session("old"));
        cache.insert(session("fresh"));
        cache.age("old", 61_000);

        let evicted = cache.purge_stale();
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(cache.get("old").is_none());
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn update_mutates_in_place() {
        let cache = SessionCache::new(1);
        cache.insert(session("s1"));

        let updated = cache.update("s1", |s| s.current_phase = 3).unwrap();
        assert_eq!(updated.current_phase, 3);
        assert_eq!(cache.get("s1").unwrap().current_phase, 3);
    }

    #[test]
    fn update_of_missing_session_is_none() {
        let cache = SessionCache::new(1);
        assert!(cache.update("ghost", |s| s.current_phase = 9).is_none());
    }
}
