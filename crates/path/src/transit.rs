//! Transit hops: one relay's view of one hop of one path.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use veilnet_core::constants::{MAX_TRANSIT_QUEUE_DEPTH, REPLAY_FILTER_WINDOW};
use veilnet_core::{
    PathId, Result, RouterId, SharedSecret, ShortHash, Time, TunnelNonce, VeilnetError,
    WireTransport,
};
use veilnet_crypto::{Crypto, Identity};

use crate::limiter::DecayingHashSet;
use crate::messages::{pack_body, unpack_body, Direction, RelayFrame, RelayTrafficMessage};
use crate::records::BuildRecord;
use crate::routing::{RoutingEnvelope, RoutingHandler, RoutingMessage, SequenceWindow};

/// Dispatch identity of a transit hop: both path-id endpoints plus the
/// neighbouring routers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitHopInfo {
    pub tx_id: PathId,
    pub rx_id: PathId,
    pub upstream: RouterId,
    pub downstream: RouterId,
}

impl TransitHopInfo {
    pub fn from_record(record: &BuildRecord, downstream: RouterId) -> TransitHopInfo {
        TransitHopInfo {
            tx_id: record.tx_id,
            rx_id: record.rx_id,
            upstream: record.upstream,
            downstream,
        }
    }
}

impl fmt::Debug for TransitHopInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[tx={} rx={} upstream={} downstream={}]",
            self.tx_id,
            self.rx_id,
            self.upstream.short_hex(),
            self.downstream.short_hex()
        )
    }
}

struct TransitState {
    last_activity: Time,
    upstream_queue: VecDeque<RelayFrame>,
    downstream_queue: VecDeque<RelayFrame>,
    upstream_filter: DecayingHashSet<TunnelNonce>,
    downstream_filter: DecayingHashSet<TunnelNonce>,
    seq_out: u64,
    seq_window: SequenceWindow,
}

/// Relay-side state for one hop. Installed under both path ids in the
/// context; shared with any in-flight work item via `Arc`.
pub struct TransitHop {
    pub info: TransitHopInfo,
    path_key: SharedSecret,
    nonce_xor: ShortHash,
    started: Time,
    lifetime: Duration,
    state: Mutex<TransitState>,
    destroy: AtomicBool,
    upstream_work: AtomicU64,
    downstream_work: AtomicU64,
    upstream_drops: AtomicU64,
    downstream_drops: AtomicU64,
}

impl TransitHop {
    pub fn new(
        crypto: &Crypto,
        info: TransitHopInfo,
        path_key: SharedSecret,
        lifetime: Duration,
        now: Time,
    ) -> TransitHop {
        let nonce_xor = crypto.short_hash(path_key.as_bytes());
        TransitHop {
            info,
            path_key,
            nonce_xor,
            started: now,
            lifetime,
            state: Mutex::new(TransitState {
                last_activity: now,
                upstream_queue: VecDeque::new(),
                downstream_queue: VecDeque::new(),
                upstream_filter: DecayingHashSet::new(REPLAY_FILTER_WINDOW),
                downstream_filter: DecayingHashSet::new(REPLAY_FILTER_WINDOW),
                seq_out: 0,
                seq_window: SequenceWindow::new(),
            }),
            destroy: AtomicBool::new(false),
            upstream_work: AtomicU64::new(0),
            downstream_work: AtomicU64::new(0),
            upstream_drops: AtomicU64::new(0),
            downstream_drops: AtomicU64::new(0),
        }
    }

    /// Install from a validated build record: run the relay side of the
    /// hop DH and decapsulate the slot-masking session key.
    pub fn from_record(
        crypto: &Crypto,
        record: &BuildRecord,
        downstream: RouterId,
        identity: &Identity,
        now: Time,
    ) -> Result<(TransitHop, SharedSecret)> {
        let shared = crypto
            .dh_server(&record.commit_pub, &identity.encryption, &record.tunnel_nonce)
            .map_err(VeilnetError::from)?;
        let pq_session = crypto
            .pqe_decrypt(&record.pq_cipher, &identity.pq.secret)
            .map_err(VeilnetError::from)?;
        let info = TransitHopInfo::from_record(record, downstream);
        let hop = TransitHop::new(crypto, info, shared, record.capped_lifetime(), now);
        Ok((hop, pq_session))
    }

    pub fn rx_id(&self) -> PathId {
        self.info.rx_id
    }

    /// The hop whose upstream is the local router terminates the path.
    pub fn is_endpoint(&self, us: &RouterId) -> bool {
        self.info.upstream == *us
    }

    pub fn expire_time(&self) -> Time {
        self.started + self.lifetime
    }

    pub fn expired(&self, now: Time) -> bool {
        self.destroy.load(Ordering::Relaxed) || now >= self.expire_time()
    }

    pub fn expires_soon(&self, now: Time, dlt: Duration) -> bool {
        now + dlt >= self.expire_time()
    }

    /// Flag for removal on the next expiry sweep.
    pub fn queue_destroy(&self) {
        self.destroy.store(true, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Time {
        self.state.lock().last_activity
    }

    pub fn drop_count(&self) -> u64 {
        self.upstream_drops.load(Ordering::Relaxed) + self.downstream_drops.load(Ordering::Relaxed)
    }

    /// Handle a frame moving deeper into the path (received from the
    /// downstream side): replay-check, strip our layer, queue for the
    /// upstream pump.
    pub fn handle_upstream(&self, crypto: &Crypto, mut frame: RelayFrame, now: Time) -> Result<()> {
        if self.expired(now) {
            return Err(VeilnetError::Expired);
        }
        let mut state = self.state.lock();
        if !state.upstream_filter.insert(frame.nonce, now) {
            return Err(VeilnetError::ReplayDetected);
        }
        state.last_activity = now;
        let mutated = frame.nonce.xor_with(&self.nonce_xor);
        crypto
            .xchacha20(&mut frame.cipher, &self.path_key, &mutated)
            .map_err(VeilnetError::from)?;
        frame.path_id = self.info.tx_id;
        if state.upstream_queue.len() >= MAX_TRANSIT_QUEUE_DEPTH {
            state.upstream_queue.pop_front();
            self.upstream_drops.fetch_add(1, Ordering::Relaxed);
        }
        state.upstream_queue.push_back(frame);
        self.upstream_work.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Handle a frame moving back toward the client (received from the
    /// upstream side): replay-check, add our layer, queue for the
    /// downstream pump.
    pub fn handle_downstream(
        &self,
        crypto: &Crypto,
        mut frame: RelayFrame,
        now: Time,
    ) -> Result<()> {
        if self.expired(now) {
            return Err(VeilnetError::Expired);
        }
        let mut state = self.state.lock();
        if !state.downstream_filter.insert(frame.nonce, now) {
            return Err(VeilnetError::ReplayDetected);
        }
        state.last_activity = now;
        let mutated = frame.nonce.xor_with(&self.nonce_xor);
        crypto
            .xchacha20(&mut frame.cipher, &self.path_key, &mutated)
            .map_err(VeilnetError::from)?;
        frame.path_id = self.info.rx_id;
        if state.downstream_queue.len() >= MAX_TRANSIT_QUEUE_DEPTH {
            state.downstream_queue.pop_front();
            self.downstream_drops.fetch_add(1, Ordering::Relaxed);
        }
        state.downstream_queue.push_back(frame);
        self.downstream_work.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Originate a routing message toward the client. The frame enters
    /// the normal downstream pipeline so it picks up our layer like any
    /// pass-through frame.
    pub fn send_routing_message(
        &self,
        crypto: &Crypto,
        message: RoutingMessage,
        now: Time,
    ) -> Result<()> {
        let seqno = {
            let mut state = self.state.lock();
            let n = state.seq_out;
            state.seq_out += 1;
            n
        };
        let env = RoutingEnvelope { seqno, message };
        let body = pack_body(&env.encode())?;
        let digest = crypto.hmac(&body, &self.path_key).map_err(VeilnetError::from)?;
        let mut cipher = Vec::with_capacity(digest.as_bytes().len() + body.len());
        cipher.extend_from_slice(digest.as_bytes());
        cipher.extend_from_slice(&body);
        let frame = RelayFrame::new(self.info.rx_id, crypto.random_nonce(), cipher)?;
        self.handle_downstream(crypto, frame, now)
    }

    /// Acknowledge a completed install toward the client.
    pub fn send_path_confirm(&self, crypto: &Crypto, now: Time) -> Result<()> {
        self.send_routing_message(
            crypto,
            RoutingMessage::PathConfirm {
                lifetime: self.lifetime,
            },
            now,
        )
    }

    /// Drain the upstream queue. Pass-through hops batch frames to the
    /// next relay; the terminal hop opens each frame and dispatches the
    /// routing message inside.
    pub fn flush_upstream(
        &self,
        crypto: &Crypto,
        transport: &dyn WireTransport,
        us: &RouterId,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) {
        let frames: Vec<RelayFrame> = {
            let mut state = self.state.lock();
            state.upstream_queue.drain(..).collect()
        };
        if frames.is_empty() {
            return;
        }
        if self.is_endpoint(us) {
            for frame in frames {
                if let Err(e) = self.handle_terminal_frame(crypto, frame, handler, now) {
                    debug!(hop = ?self.info, error = %e, "dropping terminal frame");
                }
            }
            return;
        }
        let msg = RelayTrafficMessage {
            direction: Direction::Upstream,
            frames,
        };
        if let Err(e) = transport.submit(&self.info.upstream, msg.encode()) {
            warn!(hop = ?self.info, error = %e, "upstream flush failed");
        }
    }

    /// Drain the downstream queue toward the previous hop (or client).
    pub fn flush_downstream(&self, transport: &dyn WireTransport) {
        let frames: Vec<RelayFrame> = {
            let mut state = self.state.lock();
            state.downstream_queue.drain(..).collect()
        };
        if frames.is_empty() {
            return;
        }
        let msg = RelayTrafficMessage {
            direction: Direction::Downstream,
            frames,
        };
        if let Err(e) = transport.submit(&self.info.downstream, msg.encode()) {
            warn!(hop = ?self.info, error = %e, "downstream flush failed");
        }
    }

    fn handle_terminal_frame(
        &self,
        crypto: &Crypto,
        frame: RelayFrame,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) -> Result<()> {
        let (digest, body) = frame.split_plain();
        let expected = crypto.hmac(body, &self.path_key).map_err(VeilnetError::from)?;
        if expected != digest {
            return Err(VeilnetError::InvalidMessage(
                "terminal frame digest mismatch".into(),
            ));
        }
        let payload = unpack_body(body)?;
        let env = RoutingEnvelope::decode(&payload)?;
        if !self.state.lock().seq_window.accept(env.seqno) {
            return Err(VeilnetError::ReplayDetected);
        }
        let path = self.info.rx_id;
        match env.message {
            RoutingMessage::LatencyProbe { tx_id } => {
                self.send_routing_message(crypto, RoutingMessage::LatencyReply { tx_id }, now)
            }
            RoutingMessage::ObtainExit { flags, tx_id } => {
                let reply = if handler.on_obtain_exit(path, flags, tx_id)? {
                    RoutingMessage::GrantExit { tx_id }
                } else {
                    RoutingMessage::RejectExit {
                        tx_id,
                        backoff: Duration::from_secs(30),
                    }
                };
                self.send_routing_message(crypto, reply, now)
            }
            RoutingMessage::CloseExit { tx_id } => {
                let _ = tx_id;
                handler.on_exit_closed(path)
            }
            RoutingMessage::TransferTraffic { protocol, payload } => {
                handler.on_transfer_traffic(path, protocol, &payload)
            }
            RoutingMessage::HiddenServiceFrame { payload } => {
                handler.on_hidden_service_frame(path, &payload)
            }
            RoutingMessage::DhtMessage { payload } => handler.on_dht_message(path, &payload),
            RoutingMessage::GotIntro { payload } => handler.on_got_intro(path, &payload),
            other => {
                debug!(hop = ?self.info, msg = ?other, "unexpected routing message at terminal");
                Ok(())
            }
        }
    }

    /// Drop replay-filter entries older than the nonce window.
    pub fn decay_filters(&self, now: Time) {
        let mut state = self.state.lock();
        state.upstream_filter.decay(now);
        state.downstream_filter.decay(now);
    }

    pub fn extract_status(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "txid": self.info.tx_id.to_hex(),
            "rxid": self.info.rx_id.to_hex(),
            "upstream": self.info.upstream.to_hex(),
            "downstream": self.info.downstream.to_hex(),
            "started": self.started.as_millis() as u64,
            "lifetime": self.lifetime.as_millis() as u64,
            "lastActive": state.last_activity.as_millis() as u64,
            "queuedUpstream": state.upstream_queue.len(),
            "queuedDownstream": state.downstream_queue.len(),
            "upstreamWork": self.upstream_work.load(Ordering::Relaxed),
            "downstreamWork": self.downstream_work.load(Ordering::Relaxed),
            "drops": self.drop_count(),
        })
    }
}

impl fmt::Debug for TransitHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransitHop({:?})", self.info)
    }
}
