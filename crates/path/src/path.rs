//! Client-owned paths.
//!
//! A path is an ordered list of per-hop configs plus the state machine
//! that drives it from `Building` through `Established` to one of the
//! terminal states. The client applies all hop layers itself: outbound
//! payloads are wrapped innermost-first, inbound frames unwrapped
//! outermost-first, and the plaintext is always a routing envelope.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use veilnet_core::constants::{
    LATENCY_PROBE_INTERVAL, MAX_HOPS, PATH_EXPIRES_SOON_SLACK,
};
use veilnet_core::{PathId, Result, RouterId, Time, VeilnetError, WireTransport};
use veilnet_contact::RouterContact;
use veilnet_crypto::{Crypto, EncryptionKeypair};

use crate::hop::PathHopConfig;
use crate::messages::{pack_body, unpack_body, Direction, LrcmMessage, RelayFrame, RelayTrafficMessage};
use crate::records::{BuildRecord, RecordFrame};
use crate::routing::{RoutingEnvelope, RoutingHandler, RoutingMessage, SequenceWindow};

bitflags! {
    /// What traffic a path is willing to carry. Empty means any.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PathRole: u32 {
        const OUTBOUND_HS = 1 << 0;
        const INBOUND_HS = 1 << 1;
        const EXIT = 1 << 2;
        const SVC = 1 << 3;
        const DHT = 1 << 4;
    }
}

impl PathRole {
    /// The unrestricted role.
    pub const ANY: PathRole = PathRole::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Timeout,
    Failed,
    Ignore,
    Expired,
}

impl fmt::Display for PathStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PathStatus::Building => "building",
            PathStatus::Established => "established",
            PathStatus::Timeout => "timeout",
            PathStatus::Failed => "failed",
            PathStatus::Ignore => "ignore",
            PathStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// State transitions and samples surfaced to whoever drives the path;
/// the context routes them to the owning pathset and builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvent {
    Confirmed,
    BuildTimeout,
    Expired,
    LatencySample(Duration),
    ExitGranted { tx_id: u64 },
    ExitRejected { tx_id: u64, backoff: Duration },
    ExitClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    None,
    Pending { tx_id: u64 },
    Granted { tx_id: u64 },
    Closed,
}

const LATENCY_SAMPLE_COUNT: usize = 8;

struct PathState {
    status: PathStatus,
    role: PathRole,
    last_recv: Time,
    last_latency_test: Time,
    last_latency_test_id: u64,
    latency_samples: VecDeque<Duration>,
    intro_latency: Duration,
    seq_out: u64,
    seq_window: SequenceWindow,
    discard_count: u64,
    exit: ExitState,
}

/// A circuit we built.
pub struct Path {
    hops: Vec<PathHopConfig>,
    short_name: String,
    build_started: Time,
    build_timeout: Duration,
    state: Mutex<PathState>,
}

impl Path {
    /// Generate all ephemeral material for a path over `rcs` and derive
    /// every hop secret. The path starts in `Building`; nothing has been
    /// sent yet.
    pub fn new(
        crypto: &Crypto,
        rcs: &[RouterContact],
        role: PathRole,
        short_name: impl Into<String>,
        lifetime: Duration,
        build_timeout: Duration,
        now: Time,
    ) -> Result<Path> {
        if rcs.is_empty() || rcs.len() > MAX_HOPS {
            return Err(VeilnetError::InvalidInput(format!(
                "a path needs 1..={MAX_HOPS} hops, got {}",
                rcs.len()
            )));
        }
        let mut hops: Vec<PathHopConfig> = Vec::with_capacity(rcs.len());
        for (i, rc) in rcs.iter().enumerate() {
            let commit_key = EncryptionKeypair::generate();
            let nonce = crypto.random_nonce();
            let mut tx_raw = [0u8; 16];
            crypto.random_fill(&mut tx_raw);
            let tx_id = PathId(tx_raw);
            let rx_id = if i == 0 {
                let mut rx_raw = [0u8; 16];
                crypto.random_fill(&mut rx_raw);
                PathId(rx_raw)
            } else {
                // the previous hop forwards under its own tx id
                hops[i - 1].tx_id
            };
            let upstream = if i + 1 < rcs.len() {
                rcs[i + 1].router_id()
            } else {
                rc.router_id()
            };
            let shared = crypto
                .dh_client(&rc.enc_key, &commit_key, &nonce)
                .map_err(VeilnetError::from)?;
            let nonce_xor = crypto.short_hash(shared.as_bytes());
            let (pq_cipher, pq_session) =
                crypto.pqe_encrypt(&rc.pq_key).map_err(VeilnetError::from)?;
            hops.push(PathHopConfig {
                tx_id,
                rx_id,
                rc: rc.clone(),
                commit_key,
                shared,
                nonce_xor,
                upstream,
                nonce,
                pq_session,
                pq_cipher,
                lifetime,
            });
        }
        Ok(Path {
            hops,
            short_name: short_name.into(),
            build_started: now,
            build_timeout,
            state: Mutex::new(PathState {
                status: PathStatus::Building,
                role,
                last_recv: now,
                last_latency_test: Time::ZERO,
                last_latency_test_id: 0,
                latency_samples: VecDeque::with_capacity(LATENCY_SAMPLE_COUNT),
                intro_latency: Duration::ZERO,
                seq_out: 0,
                seq_window: SequenceWindow::new(),
                discard_count: 0,
                exit: ExitState::None,
            }),
        })
    }

    pub fn hops(&self) -> &[PathHopConfig] {
        &self.hops
    }

    /// RC sequence, for rebuilding on the same relays.
    pub fn hop_rcs(&self) -> Vec<RouterContact> {
        self.hops.iter().map(|h| h.rc.clone()).collect()
    }

    /// Id our upstream frames carry toward the first hop.
    pub fn tx_id(&self) -> PathId {
        self.hops[0].tx_id
    }

    /// Id the network reaches us on.
    pub fn rx_id(&self) -> PathId {
        self.hops[0].rx_id
    }

    /// The first hop's router; every frame we send goes to it.
    pub fn upstream(&self) -> RouterId {
        self.hops[0].rc.router_id()
    }

    /// The last hop's router.
    pub fn endpoint(&self) -> RouterId {
        self.hops[self.hops.len() - 1].rc.router_id()
    }

    pub fn is_endpoint(&self, router: &RouterId, id: &PathId) -> bool {
        self.endpoint() == *router && self.hops[self.hops.len() - 1].tx_id == *id
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn hops_string(&self) -> String {
        self.hops
            .iter()
            .map(|h| h.rc.router_id().short_hex())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn status(&self) -> PathStatus {
        self.state.lock().status
    }

    pub fn role(&self) -> PathRole {
        self.state.lock().role
    }

    /// True if ALL of `roles` are supported.
    pub fn supports_all_roles(&self, roles: PathRole) -> bool {
        self.state.lock().role.contains(roles)
    }

    /// True if ANY of `roles` is supported; the empty role matches
    /// every path.
    pub fn supports_any_roles(&self, roles: PathRole) -> bool {
        roles.is_empty() || !(self.state.lock().role & roles).is_empty()
    }

    pub fn clear_roles(&self, roles: PathRole) {
        self.state.lock().role &= !roles;
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().status == PathStatus::Established
    }

    pub fn build_started(&self) -> Time {
        self.build_started
    }

    pub fn expire_time(&self) -> Time {
        self.build_started + self.hops[0].lifetime
    }

    pub fn expired(&self, now: Time) -> bool {
        if self.state.lock().status == PathStatus::Expired {
            return true;
        }
        now >= self.expire_time()
    }

    pub fn expires_soon(&self, now: Time) -> bool {
        self.expires_soon_within(now, PATH_EXPIRES_SOON_SLACK)
    }

    pub fn expires_soon_within(&self, now: Time, slack: Duration) -> bool {
        now + slack >= self.expire_time()
    }

    pub fn intro_latency(&self) -> Duration {
        self.state.lock().intro_latency
    }

    pub fn discard_count(&self) -> u64 {
        self.state.lock().discard_count
    }

    pub fn last_remote_activity(&self) -> Time {
        self.state.lock().last_recv
    }

    pub fn mark_active(&self, now: Time) {
        let mut state = self.state.lock();
        state.last_recv = state.last_recv.max(now);
    }

    fn enter_state(&self, status: PathStatus) {
        let mut state = self.state.lock();
        if state.status == status {
            return;
        }
        info!(path = %self.short_name, from = %state.status, to = %status, "path state change");
        state.status = status;
    }

    /// Mark the path dead after a drop or a failed hop.
    pub fn fail(&self) {
        self.enter_state(PathStatus::Failed);
    }

    /// The 8-slot commit message for this path's current key material.
    pub fn generate_lrcm(&self, crypto: &Crypto) -> Result<LrcmMessage> {
        let mut frames = Vec::with_capacity(MAX_HOPS);
        for (i, hop) in self.hops.iter().enumerate() {
            let record = BuildRecord {
                tx_id: hop.tx_id,
                rx_id: hop.rx_id,
                upstream: hop.upstream,
                commit_pub: hop.commit_key.public_key_bytes(),
                tunnel_nonce: hop.nonce,
                lifetime: hop.lifetime,
                pq_cipher: hop.pq_cipher.clone(),
            };
            let mut frame = RecordFrame::seal(crypto, &record, &hop.rc.enc_key)?;
            // pre-apply the masks every earlier hop will strip
            for earlier in &self.hops[..i] {
                frame.apply_mask(crypto, &earlier.pq_session, &earlier.nonce)?;
            }
            frames.push(frame);
        }
        while frames.len() < MAX_HOPS {
            frames.push(RecordFrame::random(crypto));
        }
        LrcmMessage::new(frames)
    }

    /// Apply every hop layer to `payload`, innermost first. The frame's
    /// end-to-end digest is keyed with the terminal hop's secret.
    pub fn wrap_upstream(&self, crypto: &Crypto, payload: &[u8]) -> Result<RelayFrame> {
        let terminal = &self.hops[self.hops.len() - 1];
        let body = pack_body(payload)?;
        let digest = crypto
            .hmac(&body, &terminal.shared)
            .map_err(VeilnetError::from)?;
        let mut cipher = Vec::with_capacity(digest.as_bytes().len() + body.len());
        cipher.extend_from_slice(digest.as_bytes());
        cipher.extend_from_slice(&body);

        let nonce = crypto.random_nonce();
        for hop in self.hops.iter().rev() {
            let mutated = nonce.xor_with(&hop.nonce_xor);
            crypto
                .xchacha20(&mut cipher, &hop.shared, &mutated)
                .map_err(VeilnetError::from)?;
        }
        RelayFrame::new(self.tx_id(), nonce, cipher)
    }

    /// Strip every hop layer from a frame received on our RX id and
    /// return the verified payload.
    pub fn unwrap_downstream(&self, crypto: &Crypto, frame: &RelayFrame) -> Result<Vec<u8>> {
        let mut cipher = frame.cipher.clone();
        for hop in &self.hops {
            let mutated = frame.nonce.xor_with(&hop.nonce_xor);
            crypto
                .xchacha20(&mut cipher, &hop.shared, &mutated)
                .map_err(VeilnetError::from)?;
        }
        let terminal = &self.hops[self.hops.len() - 1];
        let plain = RelayFrame::new(frame.path_id, frame.nonce, cipher)?;
        let (digest, body) = plain.split_plain();
        let expected = crypto
            .hmac(body, &terminal.shared)
            .map_err(VeilnetError::from)?;
        if expected != digest {
            return Err(VeilnetError::DecryptFailure);
        }
        unpack_body(body)
    }

    /// Wrap and submit a routing message, stamping the next sequence
    /// number.
    pub fn send_routing_message(
        &self,
        crypto: &Crypto,
        message: RoutingMessage,
        transport: &dyn WireTransport,
    ) -> Result<()> {
        let seqno = {
            let mut state = self.state.lock();
            let n = state.seq_out;
            state.seq_out += 1;
            n
        };
        let env = RoutingEnvelope { seqno, message };
        let frame = self.wrap_upstream(crypto, &env.encode())?;
        let msg = RelayTrafficMessage {
            direction: Direction::Upstream,
            frames: vec![frame],
        };
        transport.submit(&self.upstream(), msg.encode())
    }

    /// Handle one downstream frame end to end: unwrap, replay-check the
    /// sequence number, then dispatch the routing message. Returns the
    /// state transitions the caller must forward to the owning pathset.
    pub fn handle_downstream(
        &self,
        crypto: &Crypto,
        frame: &RelayFrame,
        now: Time,
        transport: &dyn WireTransport,
        handler: &mut dyn RoutingHandler,
    ) -> Result<Vec<PathEvent>> {
        let payload = self.unwrap_downstream(crypto, frame)?;
        let env = RoutingEnvelope::decode(&payload)?;
        if !self.state.lock().seq_window.accept(env.seqno) {
            return Err(VeilnetError::ReplayDetected);
        }
        self.mark_active(now);
        Ok(self.handle_routing_message(crypto, env, now, transport, handler))
    }

    fn handle_routing_message(
        &self,
        crypto: &Crypto,
        env: RoutingEnvelope,
        now: Time,
        transport: &dyn WireTransport,
        handler: &mut dyn RoutingHandler,
    ) -> Vec<PathEvent> {
        let mut events = Vec::new();
        let rx = self.rx_id();
        let outcome: Result<()> = match env.message {
            RoutingMessage::PathConfirm { lifetime } => {
                let was_building = self.status() == PathStatus::Building;
                if was_building {
                    debug!(path = %self.short_name, lifetime_ms = lifetime.as_millis() as u64, "path confirmed");
                    self.enter_state(PathStatus::Established);
                    events.push(PathEvent::Confirmed);
                }
                Ok(())
            }
            RoutingMessage::LatencyReply { tx_id } => {
                let mut state = self.state.lock();
                if state.last_latency_test_id == tx_id && tx_id != 0 {
                    let sample = now.saturating_sub(state.last_latency_test);
                    if state.latency_samples.len() >= LATENCY_SAMPLE_COUNT {
                        state.latency_samples.pop_front();
                    }
                    state.latency_samples.push_back(sample);
                    state.intro_latency = median(&state.latency_samples);
                    state.last_latency_test_id = 0;
                    events.push(PathEvent::LatencySample(sample));
                }
                Ok(())
            }
            RoutingMessage::DataDiscard { seqno, .. } => {
                self.state.lock().discard_count += 1;
                handler.on_data_discard(rx, seqno)
            }
            RoutingMessage::GrantExit { tx_id } => {
                let mut state = self.state.lock();
                if matches!(state.exit, ExitState::Pending { tx_id: pending } if pending == tx_id) {
                    state.exit = ExitState::Granted { tx_id };
                    drop(state);
                    events.push(PathEvent::ExitGranted { tx_id });
                    handler.on_exit_granted(rx, tx_id)
                } else {
                    Ok(())
                }
            }
            RoutingMessage::RejectExit { tx_id, backoff } => {
                let mut state = self.state.lock();
                if matches!(state.exit, ExitState::Pending { tx_id: pending } if pending == tx_id) {
                    state.exit = ExitState::None;
                    drop(state);
                    events.push(PathEvent::ExitRejected { tx_id, backoff });
                    handler.on_exit_rejected(rx, tx_id, backoff)
                } else {
                    Ok(())
                }
            }
            RoutingMessage::CloseExit { .. } => {
                self.state.lock().exit = ExitState::Closed;
                events.push(PathEvent::ExitClosed);
                handler.on_exit_closed(rx)
            }
            RoutingMessage::TransferTraffic { protocol, payload } => {
                handler.on_transfer_traffic(rx, protocol, &payload)
            }
            RoutingMessage::HiddenServiceFrame { payload } => {
                handler.on_hidden_service_frame(rx, &payload)
            }
            RoutingMessage::DhtMessage { payload } => handler.on_dht_message(rx, &payload),
            RoutingMessage::GotIntro { payload } => handler.on_got_intro(rx, &payload),
            RoutingMessage::LatencyProbe { tx_id } => {
                // probes are answered by the terminal hop, not by us
                let _ = (crypto, tx_id);
                Ok(())
            }
            other => {
                debug!(path = %self.short_name, msg = ?other, "ignoring routing message");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            // handler failures drop the frame; the path stays up
            warn!(path = %self.short_name, error = %e, "routing handler failed");
        }
        events
    }

    /// Ask the terminal hop for exit service.
    pub fn request_exit(
        &self,
        crypto: &Crypto,
        flags: u64,
        transport: &dyn WireTransport,
    ) -> Result<u64> {
        let tx_id = crypto.random_u64();
        self.state.lock().exit = ExitState::Pending { tx_id };
        self.send_routing_message(crypto, RoutingMessage::ObtainExit { flags, tx_id }, transport)?;
        Ok(tx_id)
    }

    pub fn close_exit(&self, crypto: &Crypto, transport: &dyn WireTransport) -> Result<()> {
        let tx_id = match self.state.lock().exit {
            ExitState::Granted { tx_id } => tx_id,
            _ => return Ok(()),
        };
        self.send_routing_message(crypto, RoutingMessage::CloseExit { tx_id }, transport)
    }

    pub fn exit_granted(&self) -> bool {
        matches!(self.state.lock().exit, ExitState::Granted { .. })
    }

    /// Periodic upkeep: build timeout, natural expiry, latency probes.
    pub fn tick(
        &self,
        crypto: &Crypto,
        now: Time,
        transport: &dyn WireTransport,
    ) -> Vec<PathEvent> {
        let mut events = Vec::new();
        match self.status() {
            PathStatus::Building => {
                if now >= self.build_started + self.build_timeout {
                    warn!(path = %self.short_name, "path build timed out");
                    self.enter_state(PathStatus::Timeout);
                    events.push(PathEvent::BuildTimeout);
                }
            }
            PathStatus::Established => {
                if self.expired(now) {
                    self.enter_state(PathStatus::Expired);
                    events.push(PathEvent::Expired);
                    return events;
                }
                let probe = {
                    let mut state = self.state.lock();
                    if now.saturating_sub(state.last_latency_test) >= LATENCY_PROBE_INTERVAL {
                        let tx_id = crypto.random_u64().max(1);
                        state.last_latency_test = now;
                        state.last_latency_test_id = tx_id;
                        Some(tx_id)
                    } else {
                        None
                    }
                };
                if let Some(tx_id) = probe {
                    if let Err(e) = self.send_routing_message(
                        crypto,
                        RoutingMessage::LatencyProbe { tx_id },
                        transport,
                    ) {
                        debug!(path = %self.short_name, error = %e, "latency probe failed to send");
                    }
                }
            }
            _ => {
                if self.expired(now) {
                    self.enter_state(PathStatus::Expired);
                }
            }
        }
        events
    }

    pub fn extract_status(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "name": self.short_name,
            "hops": self.hops.iter().map(|h| h.rc.router_id().to_hex()).collect::<Vec<_>>(),
            "status": state.status.to_string(),
            "txid": self.tx_id().to_hex(),
            "rxid": self.rx_id().to_hex(),
            "buildStarted": self.build_started.as_millis() as u64,
            "expiresAt": self.expire_time().as_millis() as u64,
            "latencyMs": state.intro_latency.as_millis() as u64,
            "discards": state.discard_count,
        })
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({} [{}])", self.short_name, self.hops_string())
    }
}

fn median(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort();
    sorted[sorted.len() / 2]
}
