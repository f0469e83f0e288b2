//! Decaying sets and the build-rate limiter.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use veilnet_core::constants::MIN_PATH_BUILD_INTERVAL;
use veilnet_core::{RouterId, Time};

/// Set whose members vanish once they are older than the configured
/// lifetime. Decay is explicit so the tick loop controls when eviction
/// work happens.
pub struct DecayingHashSet<K: Eq + Hash> {
    lifetime: Duration,
    entries: HashMap<K, Time>,
}

impl<K: Eq + Hash> DecayingHashSet<K> {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            entries: HashMap::new(),
        }
    }

    /// Insert `key` at `now`. Returns false if the key is already
    /// present and has not decayed yet.
    pub fn insert(&mut self, key: K, now: Time) -> bool {
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Insert or refresh the timestamp.
    pub fn upsert(&mut self, key: K, now: Time) {
        self.entries.insert(key, now);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop entries older than one lifetime.
    pub fn decay(&mut self, now: Time) {
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, inserted| *inserted + lifetime > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }
}

/// Soft limit on how often paths may be built over the same first-hop
/// edge. An attempt both checks and arms the cooldown.
pub struct BuildLimiter {
    edges: DecayingHashSet<RouterId>,
}

impl BuildLimiter {
    pub fn new() -> Self {
        Self {
            edges: DecayingHashSet::new(MIN_PATH_BUILD_INTERVAL),
        }
    }

    /// Returns true if a build over `edge` may proceed; arms the
    /// cooldown either way.
    pub fn attempt(&mut self, edge: RouterId, now: Time) -> bool {
        self.edges.insert(edge, now)
    }

    pub fn limited(&self, edge: &RouterId) -> bool {
        self.edges.contains(edge)
    }

    pub fn decay(&mut self, now: Time) {
        self.edges.decay(now);
    }
}

impl Default for BuildLimiter {
    fn default() -> Self {
        Self::new()
    }
}
