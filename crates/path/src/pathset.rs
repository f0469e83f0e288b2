//! Pathsets: client-side collections of paths sharing a role.
//!
//! The pathset holds the strong references; everything else sees paths
//! through weak handles in the context. Queries pick established paths
//! by endpoint, latency, or XOR closeness for the layers above.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use veilnet_core::{PathId, RouterId, Time, WireTransport};
use veilnet_crypto::Crypto;

use crate::path::{Path, PathEvent, PathRole, PathStatus};

/// Monotone counters over every build this set has attempted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub attempts: u64,
    pub success: u64,
    pub fails: u64,
    pub timeouts: u64,
}

impl BuildStats {
    pub const MIN_GOOD_RATIO: f64 = 0.25;

    pub fn success_ratio(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.success as f64 / self.attempts as f64
    }

    pub fn extract_status(&self) -> serde_json::Value {
        json!({
            "attempts": self.attempts,
            "success": self.success,
            "fails": self.fails,
            "timeouts": self.timeouts,
        })
    }
}

impl fmt::Display for BuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0} percent success (success={} attempts={} timeouts={} fails={})",
            self.success_ratio() * 100.0,
            self.success,
            self.attempts,
            self.timeouts,
            self.fails
        )
    }
}

/// A set of owned paths. Keyed by `(first-hop router, rx id)`, the same
/// pair remote peers use to address us.
pub struct PathSet {
    name: String,
    num_desired: usize,
    paths: Mutex<HashMap<(RouterId, PathId), Arc<Path>>>,
    stats: Mutex<BuildStats>,
}

impl PathSet {
    /// Maximum number of paths a set will hold.
    pub const MAX_PATHS: usize = 32;

    pub fn new(name: impl Into<String>, num_desired: usize) -> PathSet {
        PathSet {
            name: name.into(),
            num_desired: num_desired.min(Self::MAX_PATHS),
            paths: Mutex::new(HashMap::new()),
            stats: Mutex::new(BuildStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_desired(&self) -> usize {
        self.num_desired
    }

    pub fn build_stats(&self) -> BuildStats {
        *self.stats.lock()
    }

    pub fn add_path(&self, path: Arc<Path>) {
        let key = (path.upstream(), path.rx_id());
        let mut paths = self.paths.lock();
        if paths.insert(key, path).is_some() {
            warn!(set = %self.name, "replaced a path with duplicate upstream/rxid");
        }
    }

    pub fn get_by_upstream(&self, remote: &RouterId, rx_id: &PathId) -> Option<Arc<Path>> {
        self.paths.lock().get(&(*remote, *rx_id)).cloned()
    }

    /// Look up by RX id alone.
    pub fn get_path_by_id(&self, id: &PathId) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .values()
            .find(|p| p.rx_id() == *id)
            .cloned()
    }

    pub fn get_by_endpoint_with_id(&self, ep: &RouterId, id: &PathId) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .values()
            .find(|p| p.is_endpoint(ep, id))
            .cloned()
    }

    /// Ready path terminating at `router` with the lowest measured
    /// latency.
    pub fn get_path_by_router(&self, router: &RouterId, roles: PathRole) -> Option<Arc<Path>> {
        let paths = self.paths.lock();
        let mut chosen: Option<&Arc<Path>> = None;
        for path in paths.values() {
            if !path.is_ready() || !path.supports_any_roles(roles) || path.endpoint() != *router {
                continue;
            }
            let better = match chosen {
                None => true,
                Some(current) => {
                    let cur = current.intro_latency();
                    !cur.is_zero() && cur > path.intro_latency()
                }
            };
            if better {
                chosen = Some(path);
            }
        }
        chosen.cloned()
    }

    /// Ready path terminating at `router` built most recently.
    pub fn get_newest_path_by_router(
        &self,
        router: &RouterId,
        roles: PathRole,
    ) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .values()
            .filter(|p| p.is_ready() && p.supports_any_roles(roles) && p.endpoint() == *router)
            .max_by_key(|p| p.build_started())
            .cloned()
    }

    pub fn get_random_path_by_router(
        &self,
        crypto: &Crypto,
        router: &RouterId,
        roles: PathRole,
    ) -> Option<Arc<Path>> {
        let paths = self.paths.lock();
        let matching: Vec<&Arc<Path>> = paths
            .values()
            .filter(|p| p.is_ready() && p.supports_any_roles(roles) && p.endpoint() == *router)
            .collect();
        if matching.is_empty() {
            return None;
        }
        let idx = (crypto.random_u64() % matching.len() as u64) as usize;
        Some(matching[idx].clone())
    }

    /// Ready path whose endpoint minimizes the XOR metric to `target`.
    pub fn get_established_path_closest_to(
        &self,
        target: &RouterId,
        excluding: &HashSet<RouterId>,
        roles: PathRole,
    ) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .values()
            .filter(|p| {
                p.is_ready()
                    && p.supports_any_roles(roles)
                    && !excluding.contains(&p.endpoint())
            })
            .min_by_key(|p| p.endpoint().xor_distance(target))
            .cloned()
    }

    pub fn pick_random_established_path(
        &self,
        crypto: &Crypto,
        roles: PathRole,
    ) -> Option<Arc<Path>> {
        let paths = self.paths.lock();
        let established: Vec<&Arc<Path>> = paths
            .values()
            .filter(|p| p.is_ready() && p.supports_any_roles(roles))
            .collect();
        if established.is_empty() {
            return None;
        }
        let idx = (crypto.random_u64() % established.len() as u64) as usize;
        Some(established[idx].clone())
    }

    /// Established path with the lowest known latency; paths without a
    /// sample yet lose.
    pub fn pick_established_path(&self, roles: PathRole) -> Option<Arc<Path>> {
        let paths = self.paths.lock();
        let mut chosen: Option<&Arc<Path>> = None;
        for path in paths.values() {
            if !path.is_ready() || !path.supports_any_roles(roles) {
                continue;
            }
            if path.intro_latency().is_zero() {
                continue;
            }
            let better = match chosen {
                None => true,
                Some(current) => current.intro_latency() > path.intro_latency(),
            };
            if better {
                chosen = Some(path);
            }
        }
        chosen.cloned()
    }

    pub fn num_in_status(&self, status: PathStatus) -> usize {
        self.paths
            .lock()
            .values()
            .filter(|p| p.status() == status)
            .count()
    }

    pub fn available_paths(&self, roles: PathRole) -> usize {
        self.paths
            .lock()
            .values()
            .filter(|p| p.status() == PathStatus::Established && p.supports_any_roles(roles))
            .count()
    }

    /// Paths that will still be alive at `future_time`.
    pub fn num_paths_existing_at(&self, future_time: Time) -> usize {
        self.paths
            .lock()
            .values()
            .filter(|p| p.is_ready() && !p.expired(future_time))
            .count()
    }

    /// Distinct endpoints across ready paths.
    pub fn unique_endpoints(&self) -> HashSet<RouterId> {
        self.paths
            .lock()
            .values()
            .filter(|p| p.is_ready())
            .map(|p| p.endpoint())
            .collect()
    }

    /// Relays any live path crosses; these stay pinned in the nodedb.
    pub fn routers_in_use(&self) -> HashSet<RouterId> {
        let mut out = HashSet::new();
        for path in self.paths.lock().values() {
            for hop in path.hops() {
                out.insert(hop.rc.router_id());
            }
        }
        out
    }

    pub fn should_build_more(&self, now: Time) -> bool {
        let paths = self.paths.lock();
        let building = paths
            .values()
            .filter(|p| p.status() == PathStatus::Building)
            .count();
        if building >= self.num_desired {
            return false;
        }
        let usable = paths
            .values()
            .filter(|p| p.status() == PathStatus::Established && !p.expires_soon(now))
            .count();
        usable + building < self.num_desired
    }

    pub fn for_each_path(&self, mut visit: impl FnMut(&Arc<Path>)) {
        for path in self.paths.lock().values() {
            visit(path);
        }
    }

    /// Tick every path, feeding resulting events back into the stats.
    pub fn tick_paths(
        &self,
        crypto: &Crypto,
        now: Time,
        transport: &dyn WireTransport,
    ) -> Vec<(Arc<Path>, PathEvent)> {
        let paths: Vec<Arc<Path>> = self.paths.lock().values().cloned().collect();
        let mut out = Vec::new();
        for path in paths {
            for event in path.tick(crypto, now, transport) {
                self.record_event(&path, &event);
                out.push((path.clone(), event));
            }
        }
        out
    }

    /// Apply a path event to the build counters.
    pub fn record_event(&self, path: &Arc<Path>, event: &PathEvent) {
        match event {
            PathEvent::Confirmed => {
                info!(set = %self.name, path = %path.short_name(), "path established");
                self.stats.lock().success += 1;
            }
            PathEvent::BuildTimeout => {
                warn!(set = %self.name, path = %path.short_name(), "path build timed out");
                self.stats.lock().timeouts += 1;
            }
            PathEvent::Expired => {
                info!(set = %self.name, path = %path.short_name(), "path expired");
            }
            _ => {}
        }
    }

    pub fn path_build_started(&self, path: &Arc<Path>) {
        info!(set = %self.name, path = %path.short_name(), hops = %path.hops_string(), "path build started");
        self.stats.lock().attempts += 1;
    }

    pub fn handle_path_build_failed_at(&self, path: &Arc<Path>, hop: &RouterId) {
        warn!(set = %self.name, path = %path.short_name(), hop = %hop.short_hex(), "path build failed");
        self.stats.lock().fails += 1;
        path.fail();
    }

    pub fn handle_path_died(&self, path: &Arc<Path>) {
        warn!(set = %self.name, path = %path.short_name(), "path died");
        path.fail();
    }

    /// Remove dead paths, telling the transport to forget their ids.
    /// Returns how many were evicted.
    pub fn expire_paths(&self, now: Time, transport: &dyn WireTransport) -> usize {
        let mut paths = self.paths.lock();
        let doomed: Vec<(RouterId, PathId)> = paths
            .iter()
            .filter(|(_, p)| {
                p.expired(now)
                    || matches!(
                        p.status(),
                        PathStatus::Timeout | PathStatus::Failed | PathStatus::Expired
                    )
            })
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            if let Some(path) = paths.remove(key) {
                transport.forget_path(&path.tx_id());
                transport.forget_path(&path.rx_id());
            }
        }
        doomed.len()
    }

    pub fn extract_status(&self) -> serde_json::Value {
        let paths = self.paths.lock();
        json!({
            "name": self.name,
            "numDesired": self.num_desired,
            "paths": paths.values().map(|p| p.extract_status()).collect::<Vec<_>>(),
            "buildStats": self.stats.lock().extract_status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use veilnet_core::constants::PATH_BUILD_TIMEOUT;

    use crate::routing::{NullRoutingHandler, RoutingEnvelope, RoutingMessage};
    use crate::testutil::{make_relays, t, RecordingTransport};

    fn establish(crypto: &Crypto, path: &Arc<Path>, transport: &RecordingTransport) {
        let frame = {
            let env = RoutingEnvelope {
                seqno: 0,
                message: RoutingMessage::PathConfirm {
                    lifetime: Duration::from_secs(600),
                },
            };
            let up = path.wrap_upstream(crypto, &env.encode()).unwrap();
            crate::messages::RelayFrame::new(path.rx_id(), up.nonce, up.cipher).unwrap()
        };
        let mut handler = NullRoutingHandler;
        path.handle_downstream(crypto, &frame, t(1_100), transport, &mut handler)
            .unwrap();
    }

    fn make_set_with_path(crypto: &Crypto, hops: usize) -> (PathSet, Arc<Path>) {
        let relays = make_relays(crypto, hops);
        let rcs: Vec<_> = relays.iter().map(|(_, rc)| rc.clone()).collect();
        let path = Arc::new(
            Path::new(
                crypto,
                &rcs,
                PathRole::ANY,
                "p0",
                Duration::from_secs(600),
                PATH_BUILD_TIMEOUT,
                t(1_000),
            )
            .unwrap(),
        );
        let set = PathSet::new("testset", 2);
        set.add_path(path.clone());
        (set, path)
    }

    #[test]
    fn test_lookup_by_id_and_upstream() {
        let crypto = Crypto::new();
        let (set, path) = make_set_with_path(&crypto, 2);

        assert!(set.get_path_by_id(&path.rx_id()).is_some());
        assert!(set
            .get_by_upstream(&path.upstream(), &path.rx_id())
            .is_some());
        assert!(set.get_path_by_id(&PathId([9; 16])).is_none());
    }

    #[test]
    fn test_should_build_more_counts_usable_paths() {
        let crypto = Crypto::new();
        let transport = RecordingTransport::default();
        let (set, path) = make_set_with_path(&crypto, 2);

        // one building path, want two
        assert!(set.should_build_more(t(1_000)));

        establish(&crypto, &path, &transport);
        assert!(set.should_build_more(t(1_000)));

        let relays = make_relays(&crypto, 2);
        let rcs: Vec<_> = relays.iter().map(|(_, rc)| rc.clone()).collect();
        let second = Arc::new(
            Path::new(
                &crypto,
                &rcs,
                PathRole::ANY,
                "p1",
                Duration::from_secs(600),
                PATH_BUILD_TIMEOUT,
                t(1_000),
            )
            .unwrap(),
        );
        set.add_path(second.clone());
        establish(&crypto, &second, &transport);
        assert!(!set.should_build_more(t(1_000)));

        // paths about to expire stop counting
        assert!(set.should_build_more(t(1_000) + Duration::from_secs(599)));
    }

    #[test]
    fn test_build_stats_roll_up() {
        let crypto = Crypto::new();
        let (set, path) = make_set_with_path(&crypto, 2);

        set.path_build_started(&path);
        set.record_event(&path, &PathEvent::Confirmed);
        set.record_event(&path, &PathEvent::BuildTimeout);
        set.handle_path_build_failed_at(&path, &path.upstream());

        let stats = set.build_stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.fails, 1);
        assert_eq!(stats.success_ratio(), 1.0);
        assert!(stats.to_string().contains("100 percent"));
    }

    #[test]
    fn test_expire_paths_forgets_ids() {
        let crypto = Crypto::new();
        let transport = RecordingTransport::default();
        let (set, path) = make_set_with_path(&crypto, 2);
        establish(&crypto, &path, &transport);

        let expiry = t(1_000) + Duration::from_secs(600);
        let evicted = set.expire_paths(expiry, &transport);
        assert_eq!(evicted, 1);
        assert!(set.get_path_by_id(&path.rx_id()).is_none());
        let forgotten = transport.forgotten.lock();
        assert!(forgotten.contains(&path.rx_id()));
        assert!(forgotten.contains(&path.tx_id()));
    }

    #[test]
    fn test_closest_to_picks_minimum_distance() {
        let crypto = Crypto::new();
        let transport = RecordingTransport::default();
        let set = PathSet::new("xor", 4);

        let mut endpoints = Vec::new();
        for i in 0..3 {
            let relays = make_relays(&crypto, 2);
            let rcs: Vec<_> = relays.iter().map(|(_, rc)| rc.clone()).collect();
            let path = Arc::new(
                Path::new(
                    &crypto,
                    &rcs,
                    PathRole::ANY,
                    format!("p{i}"),
                    Duration::from_secs(600),
                    PATH_BUILD_TIMEOUT,
                    t(1_000),
                )
                .unwrap(),
            );
            set.add_path(path.clone());
            establish(&crypto, &path, &transport);
            endpoints.push(path.endpoint());
        }

        let target = endpoints[1];
        let chosen = set
            .get_established_path_closest_to(&target, &HashSet::new(), PathRole::ANY)
            .unwrap();
        assert_eq!(chosen.endpoint(), target);

        // excluded endpoints are skipped
        let excluding: HashSet<RouterId> = [target].into_iter().collect();
        let other = set
            .get_established_path_closest_to(&target, &excluding, PathRole::ANY)
            .unwrap();
        assert_ne!(other.endpoint(), target);
    }

    #[test]
    fn test_unique_endpoints_dedups() {
        let crypto = Crypto::new();
        let transport = RecordingTransport::default();
        let (set, path) = make_set_with_path(&crypto, 2);
        establish(&crypto, &path, &transport);

        // second path over the same relays shares the endpoint
        let rcs = path.hop_rcs();
        let twin = Arc::new(
            Path::new(
                &crypto,
                &rcs,
                PathRole::ANY,
                "twin",
                Duration::from_secs(600),
                PATH_BUILD_TIMEOUT,
                t(1_000),
            )
            .unwrap(),
        );
        set.add_path(twin.clone());
        establish(&crypto, &twin, &transport);

        assert_eq!(set.unique_endpoints().len(), 1);
        assert_eq!(set.available_paths(PathRole::ANY), 2);
    }
}
