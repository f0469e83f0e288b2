//! Tunnel Diffie-Hellman.
//!
//! The raw X25519 output is never used directly: both sides hash it with
//! both endpoint public keys in a fixed order (client first, then server)
//! and then re-hash keyed with the per-build tunnel nonce. Client and
//! server differ only in which slot their own public key occupies, so the
//! derived secret matches across one hop.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use veilnet_core::{SharedSecret, TunnelNonce};

use crate::hash::keyed_hash;
use crate::keys::EncryptionKeypair;
use crate::{CryptoError, CryptoResult};

type Blake2b256 = Blake2b<U32>;

fn mix(client_pk: &[u8; 32], server_pk: &[u8; 32], raw: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, client_pk);
    Digest::update(&mut hasher, server_pk);
    Digest::update(&mut hasher, raw);
    hasher.finalize().into()
}

fn finish(mixed: &[u8; 32], nonce: &TunnelNonce) -> CryptoResult<SharedSecret> {
    let out = keyed_hash(nonce.as_bytes(), mixed)?;
    Ok(SharedSecret(out))
}

/// Derive the hop secret as the client: we contributed the commit key,
/// the relay's encryption key is `their_pub`.
pub fn dh_client(
    their_pub: &[u8; 32],
    our_sec: &EncryptionKeypair,
    nonce: &TunnelNonce,
) -> CryptoResult<SharedSecret> {
    let raw = our_sec.diffie_hellman(their_pub);
    if raw == [0u8; 32] {
        return Err(CryptoError::Primitive("x25519 produced zero point".into()));
    }
    let mixed = mix(&our_sec.public_key_bytes(), their_pub, &raw);
    finish(&mixed, nonce)
}

/// Derive the hop secret as the relay: `their_pub` is the client's commit
/// key, ours is the advertised encryption key.
pub fn dh_server(
    their_pub: &[u8; 32],
    our_sec: &EncryptionKeypair,
    nonce: &TunnelNonce,
) -> CryptoResult<SharedSecret> {
    let raw = our_sec.diffie_hellman(their_pub);
    if raw == [0u8; 32] {
        return Err(CryptoError::Primitive("x25519 produced zero point".into()));
    }
    let mixed = mix(their_pub, &our_sec.public_key_bytes(), &raw);
    finish(&mixed, nonce)
}
