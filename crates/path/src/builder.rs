//! Path builder: hop selection and build pacing.
//!
//! The builder owns a pathset and keeps it populated: it picks hop
//! sequences out of the nodedb (biased by router profiles and the
//! per-edge cooldown), runs the commit handshake, and applies
//! exponential backoff when builds keep dying.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use veilnet_core::config::PathConfig;
use veilnet_core::constants::{MAX_HOPS, MIN_PATH_BUILD_INTERVAL, PATH_BUILD_BACKOFF_MAX};
use veilnet_core::{Result, RouterId, SendStatus, Time, VeilnetError};
use veilnet_contact::{RcSource, RouterContact};
use veilnet_crypto::Crypto;
use veilnet_nodedb::NodeDb;

use std::time::Duration;

use veilnet_core::WireTransport;

use crate::context::PathContext;
use crate::path::{Path, PathEvent, PathRole};
use crate::pathset::PathSet;
use crate::profiles::{Profiles, PROFILING_CHANCES};

struct BuilderState {
    last_build: Time,
    build_interval_limit: Duration,
    consecutive_fails: u32,
    path_counter: u64,
}

/// Keeps one pathset at its desired size.
pub struct Builder {
    pathset: Arc<PathSet>,
    role: PathRole,
    config: PathConfig,
    blacklist: Mutex<HashSet<RouterId>>,
    state: Mutex<BuilderState>,
}

impl Builder {
    pub fn new(name: impl Into<String>, role: PathRole, config: PathConfig) -> Builder {
        let num_desired = config.num_paths;
        Builder {
            pathset: Arc::new(PathSet::new(name, num_desired)),
            role,
            config,
            blacklist: Mutex::new(HashSet::new()),
            state: Mutex::new(BuilderState {
                last_build: Time::ZERO,
                build_interval_limit: MIN_PATH_BUILD_INTERVAL,
                consecutive_fails: 0,
                path_counter: 0,
            }),
        }
    }

    pub fn pathset(&self) -> &Arc<PathSet> {
        &self.pathset
    }

    pub fn role(&self) -> PathRole {
        self.role
    }

    pub fn build_interval_limit(&self) -> Duration {
        self.state.lock().build_interval_limit
    }

    /// Never route through this relay again.
    pub fn blacklist_router(&self, router: RouterId) {
        self.blacklist.lock().insert(router);
    }

    /// True while we are inside the post-failure backoff window.
    pub fn build_cooldown_hit(&self, now: Time) -> bool {
        let state = self.state.lock();
        now < state.last_build + state.build_interval_limit
    }

    pub fn should_build_more(&self, now: Time) -> bool {
        self.pathset.should_build_more(now) && !self.build_cooldown_hit(now)
    }

    fn hop_filter(
        &self,
        rc: &RouterContact,
        us: &RouterId,
        exclude: &HashSet<RouterId>,
        profiles: &Profiles,
    ) -> bool {
        let id = rc.router_id();
        id != *us
            && !exclude.contains(&id)
            && !self.blacklist.lock().contains(&id)
            && !profiles.is_bad_for_path(&id, PROFILING_CHANCES)
    }

    /// Pick a first hop we may talk to directly: profile-good for both
    /// connects and paths, and not inside the edge cooldown.
    pub fn select_first_hop(
        &self,
        nodedb: &NodeDb,
        profiles: &Profiles,
        context: &PathContext,
        us: &RouterId,
        exclude: &HashSet<RouterId>,
    ) -> Option<RouterContact> {
        nodedb.get_random(|rc| {
            self.hop_filter(rc, us, exclude, profiles)
                && !profiles.is_bad_for_connect(&rc.router_id(), PROFILING_CHANCES)
                && !context.edge_limited(&rc.router_id())
        })
    }

    /// Assemble a full hop sequence for a new build.
    pub fn get_hops_for_build(
        &self,
        nodedb: &NodeDb,
        profiles: &Profiles,
        context: &PathContext,
        us: &RouterId,
    ) -> Result<Vec<RouterContact>> {
        let num_hops = self.config.num_hops.clamp(1, MAX_HOPS);
        let mut exclude = HashSet::new();
        let first = self
            .select_first_hop(nodedb, profiles, context, us, &exclude)
            .ok_or(VeilnetError::NoRouter)?;
        exclude.insert(first.router_id());
        let mut hops = vec![first];
        while hops.len() < num_hops {
            let next = nodedb
                .get_random(|rc| self.hop_filter(rc, us, &exclude, profiles))
                .ok_or(VeilnetError::NoRouter)?;
            exclude.insert(next.router_id());
            hops.push(next);
        }
        Ok(hops)
    }

    /// Run one build attempt end to end: arm the edge cooldown, install
    /// the path, and fire the commit message at the first hop.
    pub fn build(
        &self,
        hops: Vec<RouterContact>,
        crypto: &Crypto,
        context: &PathContext,
        transport: &dyn WireTransport,
        profiles: &Arc<Profiles>,
        now: Time,
    ) -> Result<Arc<Path>> {
        let edge = hops[0].router_id();
        if !context.allow_build(&edge, now) {
            debug!(edge = %edge.short_hex(), "edge cooldown active, skipping build");
            return Err(VeilnetError::NoRouter);
        }

        let name = {
            let mut state = self.state.lock();
            state.last_build = now;
            state.path_counter += 1;
            format!("{}-{}", self.pathset.name(), state.path_counter)
        };
        let path = Arc::new(Path::new(
            crypto,
            &hops,
            self.role,
            name,
            self.config.default_lifetime,
            self.config.build_timeout,
            now,
        )?);

        context.add_own_path(&self.pathset, path.clone());
        self.pathset.path_build_started(&path);

        let lrcm = path.generate_lrcm(crypto)?;
        let profiles = profiles.clone();
        let path_for_cb = path.clone();
        let pathset = self.pathset.clone();
        transport.send_with_status(
            &edge,
            lrcm.encode(),
            Box::new(move |status| {
                if status != SendStatus::Success {
                    warn!(edge = %edge.short_hex(), ?status, "commit message delivery failed");
                    profiles.mark_hop_fail(&edge, now);
                    pathset.handle_path_build_failed_at(&path_for_cb, &edge);
                }
            }),
        )?;
        Ok(path)
    }

    /// Select hops and build, if the nodedb can satisfy us.
    pub fn build_one(
        &self,
        crypto: &Crypto,
        nodedb: &NodeDb,
        profiles: &Arc<Profiles>,
        context: &PathContext,
        transport: &dyn WireTransport,
        source: &dyn RcSource,
        now: Time,
    ) -> Result<Arc<Path>> {
        let us = source.router_id();
        let hops = self.get_hops_for_build(nodedb, profiles, context, &us)?;
        self.build(hops, crypto, context, transport, profiles, now)
    }

    /// Build a fresh path over the same relay sequence, regenerating
    /// every ephemeral key.
    pub fn rebuild(
        &self,
        path: &Arc<Path>,
        crypto: &Crypto,
        context: &PathContext,
        transport: &dyn WireTransport,
        profiles: &Arc<Profiles>,
        now: Time,
    ) -> Result<Arc<Path>> {
        info!(path = %path.short_name(), "rebuilding on the same hops");
        self.build(path.hop_rcs(), crypto, context, transport, profiles, now)
    }

    /// Digest a path event: reset pacing on success, back off and feed
    /// the profiles on failure.
    pub fn on_path_event(&self, path: &Arc<Path>, event: &PathEvent, profiles: &Profiles, now: Time) {
        match event {
            PathEvent::Confirmed => {
                let mut state = self.state.lock();
                state.consecutive_fails = 0;
                state.build_interval_limit = MIN_PATH_BUILD_INTERVAL;
                drop(state);
                let hops: Vec<RouterId> = path.hops().iter().map(|h| h.rc.router_id()).collect();
                profiles.mark_path_success(&hops, now);
            }
            PathEvent::BuildTimeout => {
                profiles.mark_path_timeout(&path.upstream(), now);
                self.backoff();
            }
            _ => {}
        }
    }

    fn backoff(&self) {
        let mut state = self.state.lock();
        state.consecutive_fails = state.consecutive_fails.saturating_add(1);
        let shift = state.consecutive_fails.min(16);
        let next = MIN_PATH_BUILD_INTERVAL
            .checked_mul(1 << shift)
            .unwrap_or(PATH_BUILD_BACKOFF_MAX);
        state.build_interval_limit = next.min(PATH_BUILD_BACKOFF_MAX);
        warn!(
            backoff_ms = state.build_interval_limit.as_millis() as u64,
            fails = state.consecutive_fails,
            "path build backoff"
        );
    }

    pub fn extract_status(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "pathset": self.pathset.extract_status(),
            "buildIntervalMs": state.build_interval_limit.as_millis() as u64,
            "consecutiveFails": state.consecutive_fails,
            "blacklisted": self.blacklist.lock().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_contact::LocalNode;
    use veilnet_core::config::NodeDbConfig;
    use veilnet_core::InlineDispatcher;
    use veilnet_crypto::Identity;

    use crate::testutil::{make_relays, t, RecordingTransport};

    fn make_world(
        crypto: &Crypto,
        relay_count: usize,
    ) -> (NodeDb, Arc<Profiles>, PathContext, LocalNode) {
        let nodedb = NodeDb::in_memory(Arc::new(InlineDispatcher), NodeDbConfig::default());
        let relays = make_relays(crypto, relay_count);
        for (_, rc) in &relays {
            nodedb.put(rc.clone(), t(1_000));
        }
        let identity = Identity::generate();
        let rc = veilnet_contact::RouterContact::new_signed(
            crypto,
            &identity,
            std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(127, 0, 0, 1), 999),
            veilnet_contact::NetId::default(),
            t(1_000),
        );
        let node = LocalNode::new(identity, rc);
        let context = PathContext::new(node.router_id());
        (nodedb, Arc::new(Profiles::new()), context, node)
    }

    fn config(hops: usize) -> PathConfig {
        PathConfig {
            num_hops: hops,
            ..PathConfig::default()
        }
    }

    #[test]
    fn test_hop_selection_dedups_and_excludes_us() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 6);
        // our own contact is in the db too
        nodedb.put(node.rc().clone(), t(1_000));

        let builder = Builder::new("b", PathRole::ANY, config(3));
        let hops = builder
            .get_hops_for_build(&nodedb, &profiles, &context, &node.router_id())
            .unwrap();
        assert_eq!(hops.len(), 3);
        let ids: HashSet<RouterId> = hops.iter().map(|rc| rc.router_id()).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&node.router_id()));
    }

    #[test]
    fn test_hop_selection_fails_on_empty_db() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 0);
        let builder = Builder::new("b", PathRole::ANY, config(3));
        assert!(matches!(
            builder.get_hops_for_build(&nodedb, &profiles, &context, &node.router_id()),
            Err(VeilnetError::NoRouter)
        ));
    }

    #[test]
    fn test_blacklisted_relays_are_skipped() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 2);
        let builder = Builder::new("b", PathRole::ANY, config(2));

        let mut all = Vec::new();
        nodedb.visit_all(|rc| all.push(rc.router_id()));
        builder.blacklist_router(all[0]);
        builder.blacklist_router(all[1]);

        assert!(matches!(
            builder.get_hops_for_build(&nodedb, &profiles, &context, &node.router_id()),
            Err(VeilnetError::NoRouter)
        ));
    }

    #[test]
    fn test_build_arms_edge_cooldown() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 4);
        let transport = RecordingTransport::default();
        let builder = Builder::new("b", PathRole::ANY, config(2));

        let path = builder
            .build_one(&crypto, &nodedb, &profiles, &context, &transport, &node, t(1_000))
            .unwrap();
        assert_eq!(transport.sent_count(), 1);

        // immediately rebuilding over the same edge is limited
        assert!(matches!(
            builder.rebuild(&path, &crypto, &context, &transport, &profiles, t(1_001)),
            Err(VeilnetError::NoRouter)
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 4);
        let transport = RecordingTransport::default();
        let builder = Builder::new("b", PathRole::ANY, config(2));

        let path = builder
            .build_one(&crypto, &nodedb, &profiles, &context, &transport, &node, t(1_000))
            .unwrap();

        builder.on_path_event(&path, &PathEvent::BuildTimeout, &profiles, t(11_000));
        assert_eq!(builder.build_interval_limit(), Duration::from_secs(1));
        builder.on_path_event(&path, &PathEvent::BuildTimeout, &profiles, t(21_000));
        assert_eq!(builder.build_interval_limit(), Duration::from_secs(2));
        for _ in 0..10 {
            builder.on_path_event(&path, &PathEvent::BuildTimeout, &profiles, t(30_000));
        }
        assert_eq!(builder.build_interval_limit(), PATH_BUILD_BACKOFF_MAX);

        // cooldown window reflects the backoff
        assert!(builder.build_cooldown_hit(t(1_000) + Duration::from_secs(29)));

        // success resets pacing
        builder.on_path_event(&path, &PathEvent::Confirmed, &profiles, t(40_000));
        assert_eq!(builder.build_interval_limit(), MIN_PATH_BUILD_INTERVAL);
    }

    #[test]
    fn test_timeout_marks_first_hop_profile() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 4);
        let transport = RecordingTransport::default();
        let builder = Builder::new("b", PathRole::ANY, config(2));

        let path = builder
            .build_one(&crypto, &nodedb, &profiles, &context, &transport, &node, t(1_000))
            .unwrap();
        let edge = path.upstream();
        assert!(profiles.get(&edge).is_none());

        builder.on_path_event(&path, &PathEvent::BuildTimeout, &profiles, t(11_000));
        assert_eq!(profiles.get(&edge).unwrap().path_timeout_count, 1);
    }

    #[test]
    fn test_confirmed_credits_every_hop() {
        let crypto = Crypto::new();
        let (nodedb, profiles, context, node) = make_world(&crypto, 4);
        let transport = RecordingTransport::default();
        let builder = Builder::new("b", PathRole::ANY, config(3));

        let path = builder
            .build_one(&crypto, &nodedb, &profiles, &context, &transport, &node, t(1_000))
            .unwrap();
        builder.on_path_event(&path, &PathEvent::Confirmed, &profiles, t(2_000));
        for hop in path.hops() {
            assert_eq!(
                profiles.get(&hop.rc.router_id()).unwrap().path_success_count,
                1
            );
        }
    }
}
