//! Router profiling.
//!
//! Per-relay counters on connects and path builds, consulted by the
//! builder to avoid relays that keep eating our build attempts. Counters
//! halve on a timer so a router can redeem itself.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use veilnet_core::{RouterId, Time};

/// How often profile counters decay.
pub const PROFILE_DECAY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default forgiveness factor for the good/bad checks.
pub const PROFILING_CHANCES: u64 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterProfile {
    pub connect_timeout_count: u64,
    pub connect_good_count: u64,
    pub path_success_count: u64,
    pub path_fail_count: u64,
    pub path_timeout_count: u64,
    pub last_updated: Time,
    pub last_decay: Time,
}

impl RouterProfile {
    pub fn is_good_for_connect(&self, chances: u64) -> bool {
        self.connect_timeout_count <= self.connect_good_count * chances + chances
    }

    pub fn is_good_for_path(&self, chances: u64) -> bool {
        if self.path_fail_count == 0 {
            return self.path_timeout_count < chances;
        }
        self.path_success_count >= self.path_fail_count * chances
    }

    pub fn is_good(&self, chances: u64) -> bool {
        self.is_good_for_connect(chances) && self.is_good_for_path(chances)
    }

    /// Halve every counter, keeping long-lived grudges bounded.
    fn decay(&mut self, now: Time) {
        self.connect_timeout_count /= 2;
        self.connect_good_count /= 2;
        self.path_success_count /= 2;
        self.path_fail_count /= 2;
        self.path_timeout_count /= 2;
        self.last_decay = now;
    }

    fn tick(&mut self, now: Time) {
        if now.saturating_sub(self.last_decay) >= PROFILE_DECAY_INTERVAL {
            self.decay(now);
        }
    }
}

/// Table of profiles for every relay we have interacted with.
#[derive(Default)]
pub struct Profiles {
    profiles: Mutex<HashMap<RouterId, RouterProfile>>,
}

impl Profiles {
    pub fn new() -> Profiles {
        Profiles::default()
    }

    fn update(&self, router: &RouterId, now: Time, apply: impl FnOnce(&mut RouterProfile)) {
        let mut profiles = self.profiles.lock();
        let profile = profiles.entry(*router).or_default();
        apply(profile);
        profile.last_updated = now;
    }

    pub fn mark_connect_success(&self, router: &RouterId, now: Time) {
        self.update(router, now, |p| p.connect_good_count += 1);
    }

    pub fn mark_connect_timeout(&self, router: &RouterId, now: Time) {
        self.update(router, now, |p| p.connect_timeout_count += 1);
    }

    /// Credit every hop of a path that confirmed.
    pub fn mark_path_success(&self, hops: &[RouterId], now: Time) {
        for hop in hops {
            self.update(hop, now, |p| p.path_success_count += 1);
        }
    }

    /// A build timed out; blame lands on the first hop, the only relay
    /// we talked to directly.
    pub fn mark_path_timeout(&self, first_hop: &RouterId, now: Time) {
        debug!(router = %first_hop.short_hex(), "recording path timeout");
        self.update(first_hop, now, |p| p.path_timeout_count += 1);
    }

    pub fn mark_path_fail(&self, hops: &[RouterId], now: Time) {
        for hop in hops {
            self.update(hop, now, |p| p.path_fail_count += 1);
        }
    }

    pub fn mark_hop_fail(&self, router: &RouterId, now: Time) {
        self.update(router, now, |p| p.path_fail_count += 1);
    }

    pub fn is_bad_for_path(&self, router: &RouterId, chances: u64) -> bool {
        self.profiles
            .lock()
            .get(router)
            .map(|p| !p.is_good_for_path(chances))
            .unwrap_or(false)
    }

    pub fn is_bad_for_connect(&self, router: &RouterId, chances: u64) -> bool {
        self.profiles
            .lock()
            .get(router)
            .map(|p| !p.is_good_for_connect(chances))
            .unwrap_or(false)
    }

    pub fn is_bad(&self, router: &RouterId, chances: u64) -> bool {
        self.profiles
            .lock()
            .get(router)
            .map(|p| !p.is_good(chances))
            .unwrap_or(false)
    }

    pub fn get(&self, router: &RouterId) -> Option<RouterProfile> {
        self.profiles.lock().get(router).copied()
    }

    pub fn clear(&self, router: &RouterId) {
        self.profiles.lock().remove(router);
    }

    /// Periodic decay pass.
    pub fn tick(&self, now: Time) {
        for profile in self.profiles.lock().values_mut() {
            profile.tick(now);
        }
    }

    pub fn extract_status(&self) -> serde_json::Value {
        let profiles = self.profiles.lock();
        json!(profiles
            .iter()
            .map(|(router, p)| {
                json!({
                    "router": router.to_hex(),
                    "connectGood": p.connect_good_count,
                    "connectTimeout": p.connect_timeout_count,
                    "pathSuccess": p.path_success_count,
                    "pathFail": p.path_fail_count,
                    "pathTimeout": p.path_timeout_count,
                })
            })
            .collect::<Vec<_>>())
    }
}
