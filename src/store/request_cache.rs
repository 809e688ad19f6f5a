use std::time::{Duration, Instant};

use dashmap::DashMap;

/// How long a cached response survives without being read again. Retries
/// arrive within a few hundred milliseconds, so one second is ample.
const DEFAULT_TTL: Duration = Duration::from_secs(1);

struct CachedResponse {
    payload: Vec<u8>,
    last_access: Instant,
}

/// Maps a request's unique message identifier to the encoded response it
/// produced. A retransmitted request replays the cached bytes instead of
/// executing again, which makes retried writes at-most-once.
pub struct RequestCache {
    responses: DashMap<Vec<u8>, CachedResponse>,
    ttl: Duration,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            responses: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, message_id: Vec<u8>, payload: Vec<u8>) {
        self.responses.insert(
            message_id,
            CachedResponse {
                payload,
                last_access: Instant::now(),
            },
        );
    }

    /// Returns the cached response for a message identifier, refreshing its
    /// expiry. The TTL counts from last access, not insertion, so a client
    /// still retrying keeps its entry alive.
    pub fn lookup(&self, message_id: &[u8]) -> Option<Vec<u8>> {
        let mut entry = self.responses.get_mut(message_id)?;
        if entry.last_access.elapsed() > self.ttl {
            drop(entry);
            self.responses.remove(message_id);
            return None;
        }
        entry.last_access = Instant::now();
        Some(entry.payload.clone())
    }

    pub fn purge_expired(&self) {
        self.responses
            .retain(|_, cached| cached.last_access.elapsed() <= self.ttl);
    }

    pub fn clear(&self) {
        self.responses.clear();
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}
