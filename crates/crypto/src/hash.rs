use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2b, Blake2bMac, Digest};

use veilnet_core::{SharedSecret, ShortHash};

use crate::{CryptoError, CryptoResult};

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

/// Blake2b-256 digest of `data`.
pub fn short_hash(data: &[u8]) -> ShortHash {
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, data);
    ShortHash(hasher.finalize().into())
}

/// Keyed Blake2b-256 over `data`.
pub fn hmac(data: &[u8], key: &SharedSecret) -> CryptoResult<ShortHash> {
    let mut mac = Blake2bMac256::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidInput("bad hmac key length".into()))?;
    Update::update(&mut mac, data);
    let out: [u8; 32] = mac.finalize_fixed().into();
    Ok(ShortHash(out))
}

/// Keyed Blake2b-256 with an arbitrary-length key; used internally where
/// the key is itself a digest.
pub(crate) fn keyed_hash(data: &[u8], key: &[u8]) -> CryptoResult<[u8; 32]> {
    let mut mac = Blake2bMac256::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidInput("bad key length".into()))?;
    Update::update(&mut mac, data);
    Ok(mac.finalize_fixed().into())
}
