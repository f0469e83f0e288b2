//! Path context: the registry every frame dispatches through.
//!
//! Owns the transit map (strong, double-indexed under tx and rx ids),
//! the owned-path map (weak; the pathsets hold the strong references),
//! both build-rate limiters, and the per-tick upkeep that expires state
//! and schedules new builds.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use veilnet_core::constants::MIN_PATH_BUILD_INTERVAL;
use veilnet_core::{PathId, Result, RouterId, Time, VeilnetError, WireTransport};
use veilnet_contact::RcSource;
use veilnet_crypto::Crypto;
use veilnet_nodedb::NodeDb;

use crate::builder::Builder;
use crate::limiter::{BuildLimiter, DecayingHashSet};
use crate::messages::{Direction, LrcmMessage, RelayTrafficMessage, WireMessage};
use crate::path::Path;
use crate::pathset::PathSet;
use crate::profiles::Profiles;
use crate::routing::RoutingHandler;
use crate::transit::{TransitHop, TransitHopInfo};

/// Either side of the hop-handler split, as stored in lookups that can
/// return both.
#[derive(Clone)]
pub enum HopHandler {
    Owned(Arc<Path>),
    Transit(Arc<TransitHop>),
}

/// Everything the context needs from its host each tick or dispatch.
pub struct Services<'a> {
    pub crypto: &'a Crypto,
    pub nodedb: &'a NodeDb,
    pub profiles: &'a Arc<Profiles>,
    pub transport: &'a dyn WireTransport,
    pub source: &'a dyn RcSource,
}

pub struct PathContext {
    our_id: RouterId,
    transit: Mutex<HashMap<PathId, Arc<TransitHop>>>,
    owned: Mutex<HashMap<PathId, Weak<Path>>>,
    limiter: Mutex<BuildLimiter>,
    transit_limiter: Mutex<DecayingHashSet<IpAddr>>,
    allow_transit: AtomicBool,
    builders: Mutex<Vec<Arc<Builder>>>,
}

impl PathContext {
    pub fn new(our_id: RouterId) -> PathContext {
        PathContext {
            our_id,
            transit: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashMap::new()),
            limiter: Mutex::new(BuildLimiter::new()),
            transit_limiter: Mutex::new(DecayingHashSet::new(MIN_PATH_BUILD_INTERVAL)),
            allow_transit: AtomicBool::new(false),
            builders: Mutex::new(Vec::new()),
        }
    }

    pub fn our_id(&self) -> RouterId {
        self.our_id
    }

    pub fn allow_transit(&self) {
        self.allow_transit.store(true, Ordering::Relaxed);
    }

    pub fn allowing_transit(&self) -> bool {
        self.allow_transit.load(Ordering::Relaxed)
    }

    pub fn hop_is_us(&self, router: &RouterId) -> bool {
        *router == self.our_id
    }

    /// Throttle incoming build requests per source address. Returns
    /// true when the sender has hit the limit.
    pub fn check_path_limit_by_ip(&self, ip: IpAddr, now: Time) -> bool {
        !self.transit_limiter.lock().insert(ip, now)
    }

    /// Client-side edge cooldown; arms on every query.
    pub fn allow_build(&self, edge: &RouterId, now: Time) -> bool {
        self.limiter.lock().attempt(*edge, now)
    }

    pub fn edge_limited(&self, edge: &RouterId) -> bool {
        self.limiter.lock().limited(edge)
    }

    pub fn register_builder(&self, builder: Arc<Builder>) {
        self.builders.lock().push(builder);
    }

    /// Install an owned path: the pathset takes the strong reference,
    /// the context indexes it weakly under both ids.
    pub fn add_own_path(&self, set: &Arc<PathSet>, path: Arc<Path>) {
        set.add_path(path.clone());
        let mut owned = self.owned.lock();
        owned.insert(path.tx_id(), Arc::downgrade(&path));
        owned.insert(path.rx_id(), Arc::downgrade(&path));
    }

    pub fn get_owned_path(&self, id: &PathId) -> Option<Arc<Path>> {
        self.owned.lock().get(id).and_then(Weak::upgrade)
    }

    /// Install a transit hop under both of its path ids.
    pub fn put_transit_hop(&self, hop: Arc<TransitHop>) {
        let mut transit = self.transit.lock();
        transit.insert(hop.info.tx_id, hop.clone());
        transit.insert(hop.info.rx_id, hop);
    }

    pub fn has_transit_hop(&self, info: &TransitHopInfo) -> bool {
        self.transit
            .lock()
            .get(&info.tx_id)
            .map(|hop| hop.info == *info)
            .unwrap_or(false)
    }

    pub fn transit_hop_by_info(&self, info: &TransitHopInfo) -> Option<Arc<TransitHop>> {
        self.transit
            .lock()
            .get(&info.tx_id)
            .filter(|hop| hop.info == *info)
            .cloned()
    }

    pub fn current_transit_count(&self) -> usize {
        self.transit.lock().len() / 2
    }

    /// Resolve the handler for a frame arriving from `remote` on the
    /// side facing the path owner.
    pub fn get_by_upstream(&self, remote: &RouterId, id: &PathId) -> Option<HopHandler> {
        if let Some(path) = self.get_owned_path(id) {
            return Some(HopHandler::Owned(path));
        }
        self.transit
            .lock()
            .get(id)
            .filter(|hop| hop.info.upstream == *remote)
            .cloned()
            .map(HopHandler::Transit)
    }

    /// Resolve the transit hop for a frame arriving from `remote` on the
    /// side facing the terminal.
    pub fn get_by_downstream(&self, remote: &RouterId, id: &PathId) -> Option<Arc<TransitHop>> {
        self.transit
            .lock()
            .get(id)
            .filter(|hop| hop.info.downstream == *remote)
            .cloned()
    }

    pub fn transit_hop_previous_is_router(&self, id: &PathId, other: &RouterId) -> bool {
        self.transit
            .lock()
            .get(id)
            .map(|hop| hop.info.downstream == *other)
            .unwrap_or(false)
    }

    /// Decode and dispatch one link message.
    pub fn handle_wire_message(
        &self,
        services: &Services<'_>,
        bytes: &[u8],
        from: &RouterId,
        from_ip: Option<IpAddr>,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) -> Result<()> {
        match WireMessage::decode(bytes)? {
            WireMessage::Lrcm(msg) => self.handle_lrcm(services, msg, from, from_ip, now),
            WireMessage::Relay(msg) => self.handle_relay(services, msg, from, handler, now),
        }
    }

    /// Relay side of a build: open our slot, install the hop, then
    /// either confirm (terminal) or forward the shifted commit message.
    pub fn handle_lrcm(
        &self,
        services: &Services<'_>,
        msg: LrcmMessage,
        from: &RouterId,
        from_ip: Option<IpAddr>,
        now: Time,
    ) -> Result<()> {
        if !self.allowing_transit() {
            return Err(VeilnetError::InvalidMessage(
                "transit not allowed on this node".into(),
            ));
        }
        if let Some(ip) = from_ip {
            if self.check_path_limit_by_ip(ip, now) {
                debug!(%ip, "dropping commit message, sender over the rate limit");
                return Err(VeilnetError::Timeout);
            }
        }

        let identity = services.source.identity();
        let record = msg.frames[0].open(services.crypto, &identity.encryption)?;
        let info = TransitHopInfo::from_record(&record, *from);
        if self.has_transit_hop(&info) {
            return Err(VeilnetError::InvalidMessage(
                "duplicate transit hop install".into(),
            ));
        }

        let (hop, pq_session) =
            TransitHop::from_record(services.crypto, &record, *from, identity, now)?;
        let hop = Arc::new(hop);
        self.put_transit_hop(hop.clone());
        info!(hop = ?hop.info, "installed transit hop");

        if hop.is_endpoint(&self.our_id) {
            // we terminate this path
            hop.send_path_confirm(services.crypto, now)?;
            return Ok(());
        }

        // shift our slot out, keep the message full with a random one,
        // and strip our session mask from the remaining slots
        let mut frames = msg.frames;
        frames.rotate_left(1);
        frames[7] = crate::records::RecordFrame::random(services.crypto);
        for frame in frames.iter_mut().take(7) {
            frame.apply_mask(services.crypto, &pq_session, &record.tunnel_nonce)?;
        }
        let forward = LrcmMessage::new(frames)?;
        services
            .transport
            .submit(&record.upstream, forward.encode())
    }

    /// Route each relay frame to its hop or owned path.
    pub fn handle_relay(
        &self,
        services: &Services<'_>,
        msg: RelayTrafficMessage,
        from: &RouterId,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) -> Result<()> {
        for frame in msg.frames {
            let result = match msg.direction {
                Direction::Upstream => match self.get_by_downstream(from, &frame.path_id) {
                    Some(hop) => hop.handle_upstream(services.crypto, frame, now),
                    None => {
                        debug!(id = %frame.path_id, "no transit hop for upstream frame");
                        services.transport.forget_path(&frame.path_id);
                        continue;
                    }
                },
                Direction::Downstream => match self.get_by_upstream(from, &frame.path_id) {
                    Some(HopHandler::Owned(path)) => self.handle_owned_downstream(
                        services, &path, frame, from, handler, now,
                    ),
                    Some(HopHandler::Transit(hop)) => {
                        hop.handle_downstream(services.crypto, frame, now)
                    }
                    None => {
                        debug!(id = %frame.path_id, "no handler for downstream frame");
                        services.transport.forget_path(&frame.path_id);
                        continue;
                    }
                },
            };
            if let Err(e) = result {
                match e {
                    VeilnetError::ReplayDetected => {
                        // dropped silently by contract
                    }
                    other => debug!(error = %other, "dropped relay frame"),
                }
            }
        }
        Ok(())
    }

    fn handle_owned_downstream(
        &self,
        services: &Services<'_>,
        path: &Arc<Path>,
        frame: crate::messages::RelayFrame,
        from: &RouterId,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) -> Result<()> {
        if path.upstream() != *from {
            return Err(VeilnetError::InvalidMessage(
                "downstream frame from unexpected router".into(),
            ));
        }
        let events =
            path.handle_downstream(services.crypto, &frame, now, services.transport, handler)?;
        if events.is_empty() {
            return Ok(());
        }
        for builder in self.builders.lock().iter() {
            if builder.pathset().get_path_by_id(&path.rx_id()).is_some() {
                for event in &events {
                    builder.pathset().record_event(path, event);
                    builder.on_path_event(path, event, services.profiles, now);
                }
                break;
            }
        }
        Ok(())
    }

    /// Drain every transit queue into the wire transport.
    pub fn pump(&self, services: &Services<'_>, handler: &mut dyn RoutingHandler, now: Time) {
        let hops: Vec<Arc<TransitHop>> = {
            let transit = self.transit.lock();
            let mut seen = Vec::with_capacity(transit.len());
            for hop in transit.values() {
                if !seen.iter().any(|h: &Arc<TransitHop>| Arc::ptr_eq(h, hop)) {
                    seen.push(hop.clone());
                }
            }
            seen
        };
        for hop in hops {
            hop.flush_upstream(services.crypto, services.transport, &self.our_id, handler, now);
            hop.flush_downstream(services.transport);
        }
    }

    /// Remove expired transit hops and dead owned-path entries, telling
    /// the transport to forget their ids.
    pub fn expire_paths(&self, now: Time, transport: &dyn WireTransport) {
        {
            let mut transit = self.transit.lock();
            let dead: Vec<PathId> = transit
                .iter()
                .filter(|(_, hop)| hop.expired(now))
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                if transit.remove(&id).is_some() {
                    transport.forget_path(&id);
                }
            }
            for hop in transit.values() {
                hop.decay_filters(now);
            }
        }
        {
            let mut owned = self.owned.lock();
            let dead: Vec<PathId> = owned
                .iter()
                .filter(|(_, weak)| match weak.upgrade() {
                    Some(path) => path.expired(now),
                    None => true,
                })
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                owned.remove(&id);
                transport.forget_path(&id);
            }
        }
    }

    /// One scheduler tick: decay limiters, tick owned paths, sweep
    /// expiry, then let each registered builder top up its pathset.
    pub fn tick(&self, services: &Services<'_>, now: Time) {
        {
            self.limiter.lock().decay(now);
            self.transit_limiter.lock().decay(now);
        }

        let builders: Vec<Arc<Builder>> = self.builders.lock().clone();
        for builder in &builders {
            let events = builder
                .pathset()
                .tick_paths(services.crypto, now, services.transport);
            for (path, event) in events {
                builder.on_path_event(&path, &event, services.profiles, now);
            }
            builder.pathset().expire_paths(now, services.transport);
        }

        self.expire_paths(now, services.transport);
        services.profiles.tick(now);

        for builder in &builders {
            if builder.should_build_more(now) {
                match builder.build_one(
                    services.crypto,
                    services.nodedb,
                    services.profiles,
                    self,
                    services.transport,
                    services.source,
                    now,
                ) {
                    Ok(path) => debug!(path = %path.short_name(), "scheduled path build"),
                    Err(VeilnetError::NoRouter) => {
                        warn!(set = %builder.pathset().name(), "no usable routers for path build")
                    }
                    Err(e) => warn!(set = %builder.pathset().name(), error = %e, "path build failed"),
                }
            }
        }
    }

    pub fn extract_status(&self) -> serde_json::Value {
        let transit = self.transit.lock();
        let owned = self.owned.lock();
        serde_json::json!({
            "router": self.our_id.to_hex(),
            "transitHops": transit.len() / 2,
            "ownedEntries": owned.len(),
            "allowTransit": self.allowing_transit(),
            "builders": self.builders.lock().iter().map(|b| b.extract_status()).collect::<Vec<_>>(),
        })
    }
}
