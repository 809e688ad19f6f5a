use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::codec::Envelope;

/// A lock whose release never arrives (its holder crashed mid-protocol) is
/// abandoned after this long and its deferred messages replayed.
const ABANDON_AFTER: Duration = Duration::from_secs(300);

/// A message parked behind a key lock, with the address it arrived from.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub envelope: Envelope,
    pub src: SocketAddr,
}

struct Lock {
    deferred: Vec<Deferred>,
    acquired_at: Instant,
}

/// Per-key write locks. Presence of a key in the map means the lock is
/// held; messages for a locked key queue behind it in arrival order and are
/// handed back to the caller on release for re-dispatch.
pub struct PendingWrites {
    locks: DashMap<Vec<u8>, Lock>,
    ttl: Duration,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::with_ttl(ABANDON_AFTER)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            ttl,
        }
    }

    /// Takes the lock for a key, or parks the message behind the current
    /// holder. Returns true when the lock was acquired.
    pub fn try_acquire_or_defer(&self, key: &[u8], message: Deferred) -> bool {
        match self.locks.entry(key.to_vec()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Lock {
                    deferred: Vec::new(),
                    acquired_at: Instant::now(),
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                slot.get_mut().deferred.push(message);
                false
            }
        }
    }

    /// Parks a message only if the key is currently locked. Used for reads,
    /// which take no lock themselves but must not overtake a write in
    /// flight. Returns true when the message was deferred.
    pub fn defer_if_locked(&self, key: &[u8], message: Deferred) -> bool {
        match self.locks.get_mut(key) {
            Some(mut lock) => {
                lock.deferred.push(message);
                true
            }
            None => false,
        }
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.locks.contains_key(key)
    }

    /// Releases a key's lock and returns everything queued behind it, in
    /// arrival order.
    pub fn release(&self, key: &[u8]) -> Vec<Deferred> {
        self.locks
            .remove(key)
            .map(|(_, lock)| lock.deferred)
            .unwrap_or_default()
    }

    /// Force-releases locks held longer than the abandonment window. Returns
    /// each released key with its queued messages, so the caller can clear
    /// any per-key protocol state before replaying them.
    pub fn abandon_expired(&self) -> Vec<(Vec<u8>, Vec<Deferred>)> {
        let expired: Vec<Vec<u8>> = self
            .locks
            .iter()
            .filter(|entry| entry.value().acquired_at.elapsed() > self.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .map(|key| {
                let replay = self.release(&key);
                (key, replay)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for PendingWrites {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tag: u8) -> Deferred {
        Deferred {
            envelope: Envelope::new(vec![tag], vec![tag]),
            src: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    #[test]
    fn second_acquire_defers() {
        let locks = PendingWrites::new();
        assert!(locks.try_acquire_or_defer(b"k", message(1)));
        assert!(!locks.try_acquire_or_defer(b"k", message(2)));
        assert!(locks.is_locked(b"k"));
    }

    #[test]
    fn release_returns_deferred_in_order() {
        let locks = PendingWrites::new();
        locks.try_acquire_or_defer(b"k", message(1));
        locks.try_acquire_or_defer(b"k", message(2));
        locks.try_acquire_or_defer(b"k", message(3));

        let replay = locks.release(b"k");
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].envelope.message_id, vec![2]);
        assert_eq!(replay[1].envelope.message_id, vec![3]);
        assert!(!locks.is_locked(b"k"));
    }

    #[test]
    fn reads_defer_only_behind_a_writer() {
        let locks = PendingWrites::new();
        assert!(!locks.defer_if_locked(b"k", message(1)));

        locks.try_acquire_or_defer(b"k", message(1));
        assert!(locks.defer_if_locked(b"k", message(2)));
        assert_eq!(locks.release(b"k").len(), 1);
    }

    #[test]
    fn locks_are_per_key() {
        let locks = PendingWrites::new();
        assert!(locks.try_acquire_or_defer(b"a", message(1)));
        assert!(locks.try_acquire_or_defer(b"b", message(2)));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn fresh_locks_survive_the_abandonment_sweep() {
        let locks = PendingWrites::new();
        locks.try_acquire_or_defer(b"k", message(1));

        assert!(locks.abandon_expired().is_empty());
        assert!(locks.is_locked(b"k"));
    }

    #[test]
    fn abandonment_reports_released_keys() {
        let locks = PendingWrites::with_ttl(Duration::from_millis(0));
        locks.try_acquire_or_defer(b"k", message(1));
        locks.try_acquire_or_defer(b"k", message(2));
        std::thread::sleep(Duration::from_millis(5));

        let abandoned = locks.abandon_expired();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].0, b"k".to_vec());
        assert_eq!(abandoned[0].1.len(), 1);
        assert!(!locks.is_locked(b"k"));
    }
}
