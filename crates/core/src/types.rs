use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Milliseconds since the unix epoch, kept as a `Duration` so interval
/// arithmetic and wall-clock comparisons share one representation. All core
/// operations take an explicit `now` so tests can fabricate time.
pub type Time = Duration;

/// Current wall-clock time. Hosts call this once per tick and pass the
/// result down; nothing inside the core reads the clock on its own.
pub fn time_now() -> Time {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// A relay's identity: its 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RouterId(pub [u8; 32]);

impl RouterId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to `other`, interpreting both ids as big-endian
    /// 256-bit integers. The resulting array compares lexicographically,
    /// which is exactly big-integer order.
    pub fn xor_distance(&self, other: &RouterId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn from_hex(s: &str) -> Option<RouterId> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(RouterId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix used in log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterId({})", self.short_hex())
    }
}

impl From<[u8; 32]> for RouterId {
    fn from(bytes: [u8; 32]) -> Self {
        RouterId(bytes)
    }
}

/// Identifier for one end of one hop of a path. 16 random bytes; paired
/// with a router id it is the dispatch key at a transit relay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PathId(pub [u8; 16]);

impl PathId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", hex::encode(&self.0[..4]))
    }
}

impl From<[u8; 16]> for PathId {
    fn from(bytes: [u8; 16]) -> Self {
        PathId(bytes)
    }
}

/// 32-byte symmetric key derived per hop via DH + hash.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log key material
        f.write_str("SharedSecret(..)")
    }
}

/// Per-frame nonce carried on the wire. 32 bytes; the stream cipher
/// consumes the leading 24.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TunnelNonce(pub [u8; 32]);

impl TunnelNonce {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Mutate this nonce with a hop's nonce-XOR mask, decorrelating the
    /// keystream each hop sees.
    pub fn xor_with(&self, mask: &ShortHash) -> TunnelNonce {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ mask.0[i];
        }
        TunnelNonce(out)
    }
}

impl fmt::Debug for TunnelNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelNonce({})", hex::encode(&self.0[..4]))
    }
}

impl From<[u8; 32]> for TunnelNonce {
    fn from(bytes: [u8; 32]) -> Self {
        TunnelNonce(bytes)
    }
}

/// Blake2b-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShortHash(pub [u8; 32]);

impl ShortHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortHash({})", hex::encode(&self.0[..4]))
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "BigArray")] pub [u8; 64]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature([0u8; 64])
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Signature {}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 64]> for Signature {
    fn from(bytes: [u8; 64]) -> Self {
        Signature(bytes)
    }
}
