//! Routing messages.
//!
//! These travel inside the layered encryption and are only ever seen in
//! plaintext by a path's two endpoints. Each is a bencoded dictionary
//! with a single-letter `A` type key and a sequence number `S`; the
//! receiving side tracks sequence numbers in a sliding window and drops
//! anything it has already accepted.

use std::time::Duration;

use veilnet_core::bencode::{DictBuilder, DictReader, Value};
use veilnet_core::constants::SEQUENCE_WINDOW;
use veilnet_core::{PathId, Result, VeilnetError};

/// A routing message plus its per-direction sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEnvelope {
    pub seqno: u64,
    pub message: RoutingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMessage {
    /// Terminal hop acknowledging a completed build.
    PathConfirm { lifetime: Duration },
    /// Round-trip probe; the terminal echoes the id back.
    LatencyProbe { tx_id: u64 },
    LatencyReply { tx_id: u64 },
    /// Peer dropped one of our frames.
    DataDiscard { path_id: PathId, seqno: u64 },
    ObtainExit { flags: u64, tx_id: u64 },
    GrantExit { tx_id: u64 },
    RejectExit { tx_id: u64, backoff: Duration },
    UpdateExit { path_id: PathId, tx_id: u64 },
    CloseExit { tx_id: u64 },
    /// Exit traffic bound for (or from) the host's IP layer.
    TransferTraffic { protocol: u64, payload: Vec<u8> },
    HiddenServiceFrame { payload: Vec<u8> },
    DhtMessage { payload: Vec<u8> },
    GotIntro { payload: Vec<u8> },
}

impl RoutingEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let b = DictBuilder::new().insert_int("S", self.seqno as i64);
        let b = match &self.message {
            RoutingMessage::PathConfirm { lifetime } => b
                .insert_bytes("A", b"P".to_vec())
                .insert_int("L", lifetime.as_millis() as i64),
            RoutingMessage::LatencyProbe { tx_id } => b
                .insert_bytes("A", b"L".to_vec())
                .insert_int("T", *tx_id as i64),
            RoutingMessage::LatencyReply { tx_id } => b
                .insert_bytes("A", b"L".to_vec())
                .insert_int("R", *tx_id as i64),
            RoutingMessage::DataDiscard { path_id, seqno } => b
                .insert_bytes("A", b"X".to_vec())
                .insert_bytes("P", path_id.as_bytes().to_vec())
                .insert_int("Z", *seqno as i64),
            RoutingMessage::ObtainExit { flags, tx_id } => b
                .insert_bytes("A", b"O".to_vec())
                .insert_int("E", *flags as i64)
                .insert_int("T", *tx_id as i64),
            RoutingMessage::GrantExit { tx_id } => b
                .insert_bytes("A", b"G".to_vec())
                .insert_int("T", *tx_id as i64),
            RoutingMessage::RejectExit { tx_id, backoff } => b
                .insert_bytes("A", b"J".to_vec())
                .insert_int("B", backoff.as_millis() as i64)
                .insert_int("T", *tx_id as i64),
            RoutingMessage::UpdateExit { path_id, tx_id } => b
                .insert_bytes("A", b"E".to_vec())
                .insert_bytes("P", path_id.as_bytes().to_vec())
                .insert_int("T", *tx_id as i64),
            RoutingMessage::CloseExit { tx_id } => b
                .insert_bytes("A", b"C".to_vec())
                .insert_int("T", *tx_id as i64),
            RoutingMessage::TransferTraffic { protocol, payload } => b
                .insert_bytes("A", b"T".to_vec())
                .insert_int("P", *protocol as i64)
                .insert_bytes("X", payload.clone()),
            RoutingMessage::HiddenServiceFrame { payload } => b
                .insert_bytes("A", b"H".to_vec())
                .insert_bytes("X", payload.clone()),
            RoutingMessage::DhtMessage { payload } => b
                .insert_bytes("A", b"M".to_vec())
                .insert_bytes("X", payload.clone()),
            RoutingMessage::GotIntro { payload } => b
                .insert_bytes("A", b"I".to_vec())
                .insert_bytes("X", payload.clone()),
        };
        b.build().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<RoutingEnvelope> {
        let (value, _) = Value::decode_prefix(bytes)?;
        let dict = DictReader::new(&value)?;
        let seqno = dict.require_int("S")? as u64;
        let tag = dict.require_bytes("A")?;
        let message = match tag {
            b"P" => RoutingMessage::PathConfirm {
                lifetime: Duration::from_millis(dict.require_int("L")?.max(0) as u64),
            },
            b"L" => {
                if let Some(reply) = dict.get("R") {
                    let tx_id = reply.as_int().ok_or_else(|| {
                        VeilnetError::InvalidMessage("latency reply id not an int".into())
                    })? as u64;
                    RoutingMessage::LatencyReply { tx_id }
                } else {
                    RoutingMessage::LatencyProbe {
                        tx_id: dict.require_int("T")? as u64,
                    }
                }
            }
            b"X" => RoutingMessage::DataDiscard {
                path_id: PathId(dict.require_array("P")?),
                seqno: dict.require_int("Z")? as u64,
            },
            b"O" => RoutingMessage::ObtainExit {
                flags: dict.require_int("E")? as u64,
                tx_id: dict.require_int("T")? as u64,
            },
            b"G" => RoutingMessage::GrantExit {
                tx_id: dict.require_int("T")? as u64,
            },
            b"J" => RoutingMessage::RejectExit {
                tx_id: dict.require_int("T")? as u64,
                backoff: Duration::from_millis(dict.require_int("B")?.max(0) as u64),
            },
            b"E" => RoutingMessage::UpdateExit {
                path_id: PathId(dict.require_array("P")?),
                tx_id: dict.require_int("T")? as u64,
            },
            b"C" => RoutingMessage::CloseExit {
                tx_id: dict.require_int("T")? as u64,
            },
            b"T" => RoutingMessage::TransferTraffic {
                protocol: dict.require_int("P")? as u64,
                payload: dict.require_bytes("X")?.to_vec(),
            },
            b"H" => RoutingMessage::HiddenServiceFrame {
                payload: dict.require_bytes("X")?.to_vec(),
            },
            b"M" => RoutingMessage::DhtMessage {
                payload: dict.require_bytes("X")?.to_vec(),
            },
            b"I" => RoutingMessage::GotIntro {
                payload: dict.require_bytes("X")?.to_vec(),
            },
            other => {
                return Err(VeilnetError::InvalidMessage(format!(
                    "unknown routing message type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(RoutingEnvelope { seqno, message })
    }
}

/// Host-side sink for routing messages the path layer does not consume
/// itself. One method per variant that crosses the core boundary; a
/// failure drops the frame but never kills the path.
pub trait RoutingHandler {
    fn on_transfer_traffic(&mut self, path: PathId, protocol: u64, payload: &[u8]) -> Result<()>;
    fn on_hidden_service_frame(&mut self, path: PathId, payload: &[u8]) -> Result<()>;
    fn on_dht_message(&mut self, path: PathId, payload: &[u8]) -> Result<()>;
    fn on_got_intro(&mut self, path: PathId, payload: &[u8]) -> Result<()>;
    fn on_exit_granted(&mut self, path: PathId, tx_id: u64) -> Result<()>;
    fn on_exit_rejected(&mut self, path: PathId, tx_id: u64, backoff: Duration) -> Result<()>;
    fn on_exit_closed(&mut self, path: PathId) -> Result<()>;
    /// Relay side: decide whether to grant an exit request.
    fn on_obtain_exit(&mut self, path: PathId, flags: u64, tx_id: u64) -> Result<bool> {
        let _ = (path, flags, tx_id);
        Ok(false)
    }
    /// The peer dropped one of our frames.
    fn on_data_discard(&mut self, path: PathId, seqno: u64) -> Result<()> {
        let _ = (path, seqno);
        Ok(())
    }
}

/// No-op handler for tests and relays without exit/hidden-service roles.
#[derive(Default)]
pub struct NullRoutingHandler;

impl RoutingHandler for NullRoutingHandler {
    fn on_transfer_traffic(&mut self, _: PathId, _: u64, _: &[u8]) -> Result<()> {
        Ok(())
    }
    fn on_hidden_service_frame(&mut self, _: PathId, _: &[u8]) -> Result<()> {
        Ok(())
    }
    fn on_dht_message(&mut self, _: PathId, _: &[u8]) -> Result<()> {
        Ok(())
    }
    fn on_got_intro(&mut self, _: PathId, _: &[u8]) -> Result<()> {
        Ok(())
    }
    fn on_exit_granted(&mut self, _: PathId, _: u64) -> Result<()> {
        Ok(())
    }
    fn on_exit_rejected(&mut self, _: PathId, _: u64, _: Duration) -> Result<()> {
        Ok(())
    }
    fn on_exit_closed(&mut self, _: PathId) -> Result<()> {
        Ok(())
    }
}

/// Sliding acceptance window over sequence numbers, 128 wide. Rejects
/// duplicates and anything older than the window.
pub struct SequenceWindow {
    highest: u64,
    /// Bit `i` set means `highest - i` was accepted.
    mask: u128,
    primed: bool,
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            mask: 0,
            primed: false,
        }
    }

    /// Accept `seq` if it has not been seen; returns false on duplicates
    /// and on anything that fell out of the window.
    pub fn accept(&mut self, seq: u64) -> bool {
        if !self.primed {
            self.primed = true;
            self.highest = seq;
            self.mask = 1;
            return true;
        }
        if seq > self.highest {
            let shift = seq - self.highest;
            if shift >= SEQUENCE_WINDOW {
                self.mask = 0;
            } else {
                self.mask <<= shift;
            }
            self.mask |= 1;
            self.highest = seq;
            return true;
        }
        let age = self.highest - seq;
        if age >= SEQUENCE_WINDOW {
            return false;
        }
        let bit = 1u128 << age;
        if self.mask & bit != 0 {
            return false;
        }
        self.mask |= bit;
        true
    }
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}
