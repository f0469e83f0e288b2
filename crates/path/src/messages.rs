//! Wire messages.
//!
//! Everything the path layer puts on a link is a bencoded dictionary
//! with an `A` key naming the message type: `C` for the route-commit
//! message, `U`/`D` for batched relay traffic. Relay frames keep a fixed
//! 848-byte shape at every hop: `path_id (16) ‖ tunnel_nonce (32) ‖
//! ciphertext (800)`, where the ciphertext covers a keyed digest and the
//! 768-byte body.

use veilnet_core::bencode::{DictBuilder, DictReader, Value};
use veilnet_core::constants::{
    MAX_HOPS, MAX_RELAY_PAYLOAD, PATH_ID_SIZE, RELAY_BODY_SIZE, RELAY_FRAME_SIZE,
    SHORT_HASH_SIZE, TUNNEL_NONCE_SIZE,
};
use veilnet_core::{PathId, Result, ShortHash, TunnelNonce, VeilnetError};

use crate::records::RecordFrame;

pub const MSG_LRCM: &str = "C";
pub const MSG_RELAY_UPSTREAM: &str = "U";
pub const MSG_RELAY_DOWNSTREAM: &str = "D";

/// digest ‖ body region that the per-hop stream layers cover.
pub const RELAY_CIPHER_SIZE: usize = SHORT_HASH_SIZE + RELAY_BODY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream,
}

/// One fixed-size relay data frame.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub path_id: PathId,
    pub nonce: TunnelNonce,
    /// `digest ‖ body`; opaque while any hop layer is applied.
    pub cipher: Vec<u8>,
}

impl RelayFrame {
    pub fn new(path_id: PathId, nonce: TunnelNonce, cipher: Vec<u8>) -> Result<RelayFrame> {
        if cipher.len() != RELAY_CIPHER_SIZE {
            return Err(VeilnetError::InvalidMessage(format!(
                "relay cipher must be {RELAY_CIPHER_SIZE} bytes, got {}",
                cipher.len()
            )));
        }
        Ok(RelayFrame {
            path_id,
            nonce,
            cipher,
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RELAY_FRAME_SIZE);
        out.extend_from_slice(self.path_id.as_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.cipher);
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<RelayFrame> {
        if bytes.len() != RELAY_FRAME_SIZE {
            return Err(VeilnetError::InvalidMessage(format!(
                "relay frame must be {RELAY_FRAME_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut path_id = [0u8; PATH_ID_SIZE];
        path_id.copy_from_slice(&bytes[..PATH_ID_SIZE]);
        let mut nonce = [0u8; TUNNEL_NONCE_SIZE];
        nonce.copy_from_slice(&bytes[PATH_ID_SIZE..PATH_ID_SIZE + TUNNEL_NONCE_SIZE]);
        Ok(RelayFrame {
            path_id: PathId(path_id),
            nonce: TunnelNonce(nonce),
            cipher: bytes[PATH_ID_SIZE + TUNNEL_NONCE_SIZE..].to_vec(),
        })
    }

    /// Split a plaintext cipher region into its digest and body parts.
    pub fn split_plain(&self) -> (ShortHash, &[u8]) {
        let mut digest = [0u8; SHORT_HASH_SIZE];
        digest.copy_from_slice(&self.cipher[..SHORT_HASH_SIZE]);
        (ShortHash(digest), &self.cipher[SHORT_HASH_SIZE..])
    }
}

impl std::fmt::Debug for RelayFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayFrame")
            .field("path_id", &self.path_id)
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// Pack a payload into the fixed 768-byte body: two-byte length prefix,
/// payload, zero padding.
pub fn pack_body(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_RELAY_PAYLOAD {
        return Err(VeilnetError::InvalidInput(format!(
            "payload of {} bytes exceeds the {MAX_RELAY_PAYLOAD}-byte body limit",
            payload.len()
        )));
    }
    let mut body = vec![0u8; RELAY_BODY_SIZE];
    body[..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    body[2..2 + payload.len()].copy_from_slice(payload);
    Ok(body)
}

pub fn unpack_body(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() != RELAY_BODY_SIZE {
        return Err(VeilnetError::InvalidMessage(format!(
            "relay body must be {RELAY_BODY_SIZE} bytes, got {}",
            body.len()
        )));
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if len > MAX_RELAY_PAYLOAD {
        return Err(VeilnetError::InvalidMessage(format!(
            "relay body claims {len} payload bytes"
        )));
    }
    Ok(body[2..2 + len].to_vec())
}

/// Batched relay traffic, one direction per message.
#[derive(Debug, Clone)]
pub struct RelayTrafficMessage {
    pub direction: Direction,
    pub frames: Vec<RelayFrame>,
}

impl RelayTrafficMessage {
    pub fn encode(&self) -> Vec<u8> {
        let tag = match self.direction {
            Direction::Upstream => MSG_RELAY_UPSTREAM,
            Direction::Downstream => MSG_RELAY_DOWNSTREAM,
        };
        DictBuilder::new()
            .insert_bytes("A", tag.as_bytes().to_vec())
            .insert(
                "F",
                Value::List(
                    self.frames
                        .iter()
                        .map(|f| Value::Bytes(f.to_wire()))
                        .collect(),
                ),
            )
            .insert_int("V", 0)
            .build()
            .encode()
    }

    fn from_dict(dict: &DictReader<'_>, direction: Direction) -> Result<RelayTrafficMessage> {
        let list = dict
            .require("F")?
            .as_list()
            .ok_or_else(|| VeilnetError::InvalidMessage("frame slot is not a list".into()))?;
        let frames = list
            .iter()
            .map(|v| {
                let bytes = v
                    .as_bytes()
                    .ok_or_else(|| VeilnetError::InvalidMessage("frame is not bytes".into()))?;
                RelayFrame::from_wire(bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RelayTrafficMessage { direction, frames })
    }
}

/// The 8-slot layered route-commit message that initiates a build.
#[derive(Clone)]
pub struct LrcmMessage {
    pub frames: Vec<RecordFrame>,
}

impl LrcmMessage {
    pub fn new(frames: Vec<RecordFrame>) -> Result<LrcmMessage> {
        if frames.len() != MAX_HOPS {
            return Err(VeilnetError::InvalidMessage(format!(
                "route-commit message must carry {MAX_HOPS} slots, got {}",
                frames.len()
            )));
        }
        Ok(LrcmMessage { frames })
    }

    pub fn encode(&self) -> Vec<u8> {
        DictBuilder::new()
            .insert_bytes("A", MSG_LRCM.as_bytes().to_vec())
            .insert(
                "F",
                Value::List(
                    self.frames
                        .iter()
                        .map(|f| Value::Bytes(f.as_bytes().to_vec()))
                        .collect(),
                ),
            )
            .insert_int("V", 0)
            .build()
            .encode()
    }

    fn from_dict(dict: &DictReader<'_>) -> Result<LrcmMessage> {
        let list = dict
            .require("F")?
            .as_list()
            .ok_or_else(|| VeilnetError::InvalidMessage("frame slot is not a list".into()))?;
        let frames = list
            .iter()
            .map(|v| {
                let bytes = v
                    .as_bytes()
                    .ok_or_else(|| VeilnetError::InvalidMessage("record frame not bytes".into()))?;
                RecordFrame::from_bytes(bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        LrcmMessage::new(frames)
    }
}

impl std::fmt::Debug for LrcmMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LrcmMessage({} slots)", self.frames.len())
    }
}

/// Any link-level message the path layer understands.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Lrcm(LrcmMessage),
    Relay(RelayTrafficMessage),
}

impl WireMessage {
    pub fn decode(bytes: &[u8]) -> Result<WireMessage> {
        let value = Value::decode(bytes)?;
        let dict = DictReader::new(&value)?;
        let tag = dict.require_bytes("A")?;
        match tag {
            b"C" => Ok(WireMessage::Lrcm(LrcmMessage::from_dict(&dict)?)),
            b"U" => Ok(WireMessage::Relay(RelayTrafficMessage::from_dict(
                &dict,
                Direction::Upstream,
            )?)),
            b"D" => Ok(WireMessage::Relay(RelayTrafficMessage::from_dict(
                &dict,
                Direction::Downstream,
            )?)),
            other => Err(VeilnetError::InvalidMessage(format!(
                "unknown message type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}
