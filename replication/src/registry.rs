//! Concurrent map from session key to aggregator.

use crate::{aggregator::Aggregator, envelope::Key};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

enum Entry {
    Active(Arc<Aggregator>),

    /// A finished session. Shards arriving before `expires` are dropped instead of
    /// starting a new aggregator.
    Completed { expires: Instant },
}

/// Tracks every session this server knows about.
pub struct Registry {
    tombstone_ttl: Duration,
    sessions: Mutex<HashMap<Key, Entry>>,
}

impl Registry {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            tombstone_ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the aggregator registered under `key`, creating it with `create` if absent.
    ///
    /// Concurrent callers with the same key always receive the same aggregator. The returned
    /// flag is `true` for the single caller that created it. Returns `None` if the session
    /// has already completed.
    pub fn get_or_create(
        &self,
        key: Key,
        create: impl FnOnce() -> Aggregator,
    ) -> Option<(Arc<Aggregator>, bool)> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&key) {
            Some(Entry::Active(aggregator)) => return Some((aggregator.clone(), false)),
            Some(Entry::Completed { .. }) => return None,
            None => {}
        }
        let aggregator = Arc::new(create());
        sessions.insert(key, Entry::Active(aggregator.clone()));
        Some((aggregator, true))
    }

    /// Returns the active aggregator registered under `key`, if any.
    pub fn get(&self, key: &Key) -> Option<Arc<Aggregator>> {
        match self.sessions.lock().unwrap().get(key) {
            Some(Entry::Active(aggregator)) => Some(aggregator.clone()),
            _ => None,
        }
    }

    /// Whether `key` belongs to a recently completed session.
    pub fn is_completed(&self, key: &Key) -> bool {
        matches!(
            self.sessions.lock().unwrap().get(key),
            Some(Entry::Completed { .. })
        )
    }

    /// Removes the aggregator registered under `key`, leaving a tombstone behind.
    pub fn remove(&self, key: &Key) -> Option<Arc<Aggregator>> {
        let expires = Instant::now() + self.tombstone_ttl;
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.insert(*key, Entry::Completed { expires }) {
            Some(Entry::Active(aggregator)) => Some(aggregator),
            _ => None,
        }
    }

    /// Tombstones every active session whose deadline is at or before `now` and forgets
    /// every tombstone that has expired.
    ///
    /// Returns the aggregators that were expired so the caller can fail them.
    pub fn prune(&self, now: Instant) -> Vec<Arc<Aggregator>> {
        let expires = now + self.tombstone_ttl;
        let mut expired = Vec::new();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, entry| match entry {
            Entry::Active(aggregator) => {
                if aggregator.deadline() <= now {
                    expired.push(aggregator.clone());
                    *entry = Entry::Completed { expires };
                }
                true
            }
            Entry::Completed { expires: until } => *until > now,
        });
        expired
    }

    /// The number of active sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|entry| matches!(entry, Entry::Active(_)))
            .count()
    }

    /// Whether there are no active sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Direction, Header, Parameters, SessionId};
    use std::{sync::Barrier, thread};

    fn header(session: SessionId) -> Header {
        Header {
            session,
            direction: Direction::Request,
            request_type: 0,
            parameters: Parameters {
                total_shards: 3,
                data_shards: 2,
                parity_shards: 1,
                shard_length: 4,
            },
            commitment: [0; 32],
        }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        let session = SessionId::random();
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry
                        .get_or_create((session, Direction::Request), || {
                            Aggregator::new(header(session), Instant::now())
                        })
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        for (aggregator, _) in &results {
            assert!(Arc::ptr_eq(aggregator, &results[0].0));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_directions_are_separate() {
        let registry = Registry::new(Duration::from_secs(60));
        let session = SessionId::random();
        let (request, _) = registry
            .get_or_create((session, Direction::Request), || {
                Aggregator::new(header(session), Instant::now())
            })
            .unwrap();
        let (response, created) = registry
            .get_or_create((session, Direction::Response), || {
                Aggregator::new(header(session), Instant::now())
            })
            .unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&request, &response));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let registry = Registry::new(Duration::from_secs(60));
        let session = SessionId::random();
        let key = (session, Direction::Request);
        registry
            .get_or_create(key, || Aggregator::new(header(session), Instant::now()))
            .unwrap();
        assert!(registry.remove(&key).is_some());
        assert!(registry.is_empty());
        assert!(registry.is_completed(&key));
        assert!(registry.get(&key).is_none());

        // Late shards cannot resurrect the session
        assert!(registry
            .get_or_create(key, || Aggregator::new(header(session), Instant::now()))
            .is_none());
        assert!(registry.remove(&key).is_none());
    }

    #[test]
    fn test_prune() {
        let ttl = Duration::from_secs(10);
        let registry = Registry::new(ttl);
        let start = Instant::now();

        let stale = SessionId::random();
        let fresh = SessionId::random();
        registry
            .get_or_create((stale, Direction::Request), || {
                Aggregator::new(header(stale), start + Duration::from_secs(1))
            })
            .unwrap();
        registry
            .get_or_create((fresh, Direction::Request), || {
                Aggregator::new(header(fresh), start + Duration::from_secs(100))
            })
            .unwrap();

        // Only the session past its deadline is expired
        let now = start + Duration::from_secs(5);
        let expired = registry.prune(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].header().session, stale);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_completed(&(stale, Direction::Request)));

        // The tombstone outlives the deadline by the ttl
        assert!(registry.prune(now + ttl - Duration::from_secs(1)).is_empty());
        assert!(registry.is_completed(&(stale, Direction::Request)));
        registry.prune(now + ttl);
        assert!(!registry.is_completed(&(stale, Direction::Request)));
        assert_eq!(registry.len(), 1);
    }
}
